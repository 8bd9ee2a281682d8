//! LanShare CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信；`browse` 和下载命令在进程内直接访问对端

mod client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanshare_core::config::format_file_size;
use lanshare_core::transfer::{
    ProgressSnapshot, download_url, local_destination, peer_base_url, search_files,
};
use lanshare_core::{
    DownloadCallback, DownloadClient, DownloadRequest, NoopCallback, Settings, Sha256Digest,
    TaskState,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanshare", version, about = "LanShare - 局域网文件共享")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看守护进程状态
    Status,
    /// 列出发现的对端
    Peers,
    /// 共享文件或目录
    Share {
        /// 文件或目录路径
        path: PathBuf,
    },
    /// 取消共享
    Unshare {
        /// 共享文件 ID
        id: String,
    },
    /// 列出共享文件
    Shares,
    /// 列出最近访问过本机的对端
    Connections,
    /// 手动添加对端 (ip:port)
    AddPeer {
        address: String,
    },
    /// 移除对端 (实例 ID 或 ip:port)
    RemovePeer {
        key: String,
    },
    /// 列出对端的共享文件
    Browse {
        /// 对端地址 (ip:port)
        peer: String,
        /// 按文件名过滤 (不区分大小写)
        query: Option<String>,
        /// 访问令牌
        #[arg(long)]
        token: Option<String>,
    },
    /// 下载对端的全部共享文件
    DownloadAll {
        /// 对端地址 (ip:port)
        peer: String,
        /// 只下载文件名包含该字符串的文件
        #[arg(short, long)]
        filter: Option<String>,
        /// 保存目录 (默认: 下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 每个文件的下载线程数
        #[arg(short, long)]
        threads: Option<usize>,
        /// 访问令牌
        #[arg(long)]
        token: Option<String>,
    },
    /// 从对端下载文件
    Download {
        /// 下载地址，如 http://192.168.1.20:8000/download/<id>
        url: String,
        /// 保存路径 (默认: 下载目录下的原文件名)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 预期的 SHA-256 (hex)
        #[arg(long)]
        checksum: Option<Sha256Digest>,
        /// 下载线程数
        #[arg(short, long)]
        threads: Option<usize>,
        /// 忽略已有的续传记录
        #[arg(long)]
        fresh: bool,
        /// 访问令牌
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let resp = client::send_request(client::IpcRequest::Status).await?;
            if let client::IpcResponse::Status(s) = resp {
                println!("设备: {} ({})", s.device_name, s.instance_id);
                println!("服务: http://{}", s.server_addr);
                match s.discovery_addr {
                    Some(addr) => println!("发现: {addr}"),
                    None => println!("发现: 未运行"),
                }
                println!("共享: {} 个文件, {}", s.shared_files, s.shared_size);
                println!("活跃连接: {}  对端: {}", s.active_connections, s.peers);
            }
        }
        Commands::Peers => {
            let resp = client::send_request(client::IpcRequest::Peers).await?;
            if let client::IpcResponse::Peers { peers } = resp {
                if peers.is_empty() {
                    println!("   未发现对端");
                } else {
                    for (i, peer) in peers.iter().enumerate() {
                        let tag = if peer.manual { " [手动]" } else { "" };
                        println!("   [{}] {} ({}){}", i, peer.name, peer.address, tag);
                    }
                }
            }
        }
        Commands::Share { path } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("无法访问 {}", path.display()))?;
            client::send_request(client::IpcRequest::Share {
                path: path.to_string_lossy().to_string(),
            })
            .await?;
        }
        Commands::Unshare { id } => {
            client::send_request(client::IpcRequest::Unshare { id }).await?;
        }
        Commands::Shares => {
            let resp = client::send_request(client::IpcRequest::Shares).await?;
            if let client::IpcResponse::Shares { files } = resp {
                if files.is_empty() {
                    println!("   没有共享文件");
                }
                for f in files {
                    let folder = if f.folder.is_empty() {
                        String::new()
                    } else {
                        format!("{}/", f.folder)
                    };
                    println!("   {}  {}{}  ({})", f.id, folder, f.name, f.size);
                }
            }
        }
        Commands::Connections => {
            let resp = client::send_request(client::IpcRequest::Connections).await?;
            if let client::IpcResponse::Connections { connections } = resp {
                if connections.is_empty() {
                    println!("   没有活跃连接");
                }
                for c in connections {
                    println!(
                        "   {}  {} 次请求  最近: {}",
                        c.address,
                        c.requests,
                        c.last_action.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::AddPeer { address } => {
            client::send_request(client::IpcRequest::AddPeer { address }).await?;
        }
        Commands::RemovePeer { key } => {
            client::send_request(client::IpcRequest::RemovePeer { key }).await?;
        }
        Commands::Browse { peer, query, token } => {
            init_logging();
            let settings = Settings::load();
            browse(&settings, &peer, query.as_deref(), token.as_deref()).await?;
        }
        Commands::DownloadAll {
            peer,
            filter,
            output,
            threads,
            token,
        } => {
            init_logging();
            let settings = Settings::load();
            let root = output.unwrap_or_else(|| settings.download_dir.clone());
            download_all(&settings, &peer, filter.as_deref(), root, threads, token).await?;
        }
        Commands::Download {
            url,
            output,
            checksum,
            threads,
            fresh,
            token,
        } => {
            init_logging();
            let settings = Settings::load();
            let client = DownloadClient::new(&settings)?;
            let destination = match output {
                Some(path) => path,
                None => {
                    let name = resolve_file_name(&client, &url, token.as_deref()).await;
                    settings.download_dir.join(name)
                }
            };
            download(
                &client,
                DownloadRequest {
                    url,
                    destination,
                    expected_checksum: checksum,
                    threads,
                    fresh,
                    token,
                },
            )
            .await?;
        }
    }

    Ok(())
}

/// 下载时 core 的日志写到 stderr，默认只显示警告
fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}

/// Ctrl-C 时取消下载，已写入的部分保存为续传记录
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });
    cancel
}

async fn download(client: &DownloadClient, request: DownloadRequest) -> Result<()> {
    println!("📥 {} -> {}", request.url, request.destination.display());
    let cancel = cancel_on_ctrl_c();

    match client
        .download(request, Arc::new(ConsoleProgress), cancel)
        .await
    {
        Ok(report) => {
            println!();
            println!(
                "✅ 完成: {} ({}, {} 线程, {:.1}s)",
                report.destination.display(),
                format_file_size(report.total_bytes),
                report.threads,
                report.elapsed.as_secs_f64()
            );
            if report.resumed_from > 0 {
                println!("   从 {} 处续传", format_file_size(report.resumed_from));
            }
            if let Some(digest) = report.digest {
                println!("   SHA-256: {digest}");
            }
            Ok(())
        }
        Err(e) => {
            println!();
            if e.is_resumable() {
                eprintln!("⏸️  下载中断，再次运行同一命令即可续传");
            }
            Err(e.into())
        }
    }
}

/// 在终端打印进度
struct ConsoleProgress;

impl DownloadCallback for ConsoleProgress {
    fn on_state(&self, state: TaskState) {
        if state == TaskState::Verifying {
            print!("\n🔍 校验中...");
            let _ = std::io::stdout().flush();
        }
    }

    fn on_progress(&self, progress: &ProgressSnapshot) {
        let eta = progress
            .eta
            .map_or_else(|| "--".to_string(), |d| format!("{}s", d.as_secs()));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let speed = format_file_size(progress.speed as u64);
        print!(
            "\r   {:>5.1}%  {} / {}  {}/s  ETA {}   ",
            progress.percent(),
            format_file_size(progress.bytes_completed),
            format_file_size(progress.total_bytes),
            speed,
            eta
        );
        let _ = std::io::stdout().flush();
    }
}

/// 从对端的文件列表中查出 ID 对应的文件名，失败时用 ID 本身
async fn resolve_file_name(client: &DownloadClient, url: &str, token: Option<&str>) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "download".to_string();
    };
    let Some(id) = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(str::to_string)
    else {
        return "download".to_string();
    };
    let Ok(base) = parsed.join("/") else {
        return id;
    };

    match client.fetch_listing(&base, token).await {
        Ok(listing) => listing
            .files
            .into_iter()
            .find(|f| f.id == id)
            .map_or(id, |f| f.name),
        Err(e) => {
            eprintln!("⚠️  无法获取文件列表: {e}");
            id
        }
    }
}

async fn browse(
    settings: &Settings,
    peer: &str,
    query: Option<&str>,
    token: Option<&str>,
) -> Result<()> {
    let client = DownloadClient::new(settings)?;
    let base = peer_base_url(peer)?;
    let listing = client.fetch_listing(&base, token).await?;
    let files = search_files(&listing.files, query.unwrap_or_default());
    if files.is_empty() {
        println!("   没有匹配的文件");
    }
    for f in files {
        let folder = if f.folder.is_empty() {
            String::new()
        } else {
            format!("{}/", f.folder)
        };
        println!("   {}  {}{}  ({})", f.id, folder, f.name, f.size);
    }
    Ok(())
}

async fn download_all(
    settings: &Settings,
    peer: &str,
    filter: Option<&str>,
    root: PathBuf,
    threads: Option<usize>,
    token: Option<String>,
) -> Result<()> {
    let client = DownloadClient::new(settings)?;
    let base = peer_base_url(peer)?;
    let listing = client.fetch_listing(&base, token.as_deref()).await?;
    let files = search_files(&listing.files, filter.unwrap_or_default());
    if files.is_empty() {
        println!("   没有匹配的文件");
        return Ok(());
    }

    let mut requests = Vec::with_capacity(files.len());
    for file in &files {
        requests.push(DownloadRequest {
            url: download_url(&base, file)?.to_string(),
            destination: local_destination(&root, file)?,
            threads,
            token: token.clone(),
            ..Default::default()
        });
    }
    println!("📥 {} 个文件 -> {}", requests.len(), root.display());

    let results = client
        .download_many(requests, Arc::new(NoopCallback), cancel_on_ctrl_c())
        .await;
    let mut failed = 0;
    for (file, result) in files.iter().zip(results) {
        match result {
            Ok(report) => println!(
                "   ✅ {} ({})",
                report.destination.display(),
                format_file_size(report.total_bytes)
            ),
            Err(e) => {
                failed += 1;
                eprintln!("   ❌ {}: {}", file.name, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} 个文件下载失败，再次运行同一命令即可续传");
    }
    Ok(())
}
