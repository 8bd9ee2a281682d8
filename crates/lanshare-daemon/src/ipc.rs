//! IPC Server - Unix Domain Socket 通信

use crate::service::Daemon;
use anyhow::Result;
use lanshare_core::config::format_file_size;
use lanshare_core::{ConnectionRecord, PeerRecord, ShareEntry};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("lanshare.sock")
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "peers")]
    Peers,
    #[serde(rename = "share")]
    Share { path: String },
    #[serde(rename = "unshare")]
    Unshare { id: String },
    #[serde(rename = "shares")]
    Shares,
    #[serde(rename = "connections")]
    Connections,
    #[serde(rename = "add_peer")]
    AddPeer { address: String },
    #[serde(rename = "remove_peer")]
    RemovePeer { key: String },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status(StatusInfo),
    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerInfo> },
    #[serde(rename = "shares")]
    Shares { files: Vec<ShareInfo> },
    #[serde(rename = "connections")]
    Connections { connections: Vec<ConnectionInfo> },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusInfo {
    pub device_name: String,
    pub instance_id: String,
    pub server_addr: String,
    pub discovery_addr: Option<String>,
    pub shared_files: usize,
    pub shared_size: String,
    pub active_connections: usize,
    pub peers: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub manual: bool,
    pub last_seen: u64,
}

impl From<PeerRecord> for PeerInfo {
    fn from(p: PeerRecord) -> Self {
        Self {
            id: p.instance_id,
            name: p.display_name,
            address: p.address.to_string(),
            manual: p.manual,
            last_seen: p.last_seen_unix,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShareInfo {
    pub id: String,
    pub name: String,
    pub size: String,
    pub folder: String,
}

impl From<ShareEntry> for ShareInfo {
    fn from(e: ShareEntry) -> Self {
        Self {
            size: format_file_size(e.size_bytes),
            id: e.id,
            name: e.display_name,
            folder: e.folder_path,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionInfo {
    pub address: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub requests: usize,
    pub last_action: Option<String>,
}

impl From<ConnectionRecord> for ConnectionInfo {
    fn from(c: ConnectionRecord) -> Self {
        let last_action = c.action_history.last().map(|a| match &a.file_id {
            Some(id) => format!("{:?} {}", a.kind, id),
            None => format!("{:?}", a.kind),
        });
        Self {
            address: c.peer_address.to_string(),
            first_seen: c.first_seen,
            last_seen: c.last_seen,
            requests: c.action_history.len(),
            last_action,
        }
    }
}

pub async fn run_ipc_server(daemon: Arc<Daemon>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, daemon).await {
                        tracing::debug!("IPC client error: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, daemon: Arc<Daemon>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("收到请求: {:?}", request);
                dispatch(&daemon, request).await
            }
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {e}"),
            },
        };
        write_response(&mut writer, &response).await?;
        line.clear();
    }

    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &IpcResponse,
) -> Result<()> {
    writer
        .write_all(serde_json::to_string(response)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

pub async fn dispatch(daemon: &Daemon, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Status => {
            let s = daemon.status().await;
            IpcResponse::Status(StatusInfo {
                device_name: s.device_name,
                instance_id: s.instance_id,
                server_addr: s.server_addr.to_string(),
                discovery_addr: s.discovery_addr.map(|a| a.to_string()),
                shared_files: s.shared_files,
                shared_size: format_file_size(s.shared_bytes),
                active_connections: s.active_connections,
                peers: s.peers,
            })
        }
        IpcRequest::Peers => IpcResponse::Peers {
            peers: daemon.peers().into_iter().map(PeerInfo::from).collect(),
        },
        IpcRequest::Share { path } => {
            tracing::info!("共享: {}", path);
            match daemon.share(Path::new(&path)) {
                Ok(summary) => IpcResponse::Ok {
                    message: format!(
                        "已共享 {} 个文件（跳过 {} 个）",
                        summary.added, summary.skipped
                    ),
                },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        IpcRequest::Unshare { id } => match daemon.unshare(&id) {
            Some(entry) => IpcResponse::Ok {
                message: format!("已取消共享: {}", entry.display_name),
            },
            None => IpcResponse::Error {
                message: format!("未找到共享文件: {id}"),
            },
        },
        IpcRequest::Shares => IpcResponse::Shares {
            files: daemon.shares().into_iter().map(ShareInfo::from).collect(),
        },
        IpcRequest::Connections => IpcResponse::Connections {
            connections: daemon
                .connections()
                .into_iter()
                .map(ConnectionInfo::from)
                .collect(),
        },
        IpcRequest::AddPeer { address } => {
            let addr: SocketAddr = match address.parse() {
                Ok(a) => a,
                Err(e) => {
                    return IpcResponse::Error {
                        message: format!("Invalid address {address}: {e}"),
                    };
                }
            };
            match daemon.add_peer(addr).await {
                Ok(peer) => IpcResponse::Ok {
                    message: format!("已添加对端: {}", peer.address),
                },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        IpcRequest::RemovePeer { key } => match daemon.remove_peer(&key) {
            Some(peer) => IpcResponse::Ok {
                message: format!("已移除对端: {} ({})", peer.display_name, peer.address),
            },
            None => IpcResponse::Error {
                message: format!("未找到对端: {key}"),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::Settings;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&IpcRequest::AddPeer {
            address: "10.0.0.2:8000".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"add_peer","address":"10.0.0.2:8000"}"#);

        let parsed: IpcRequest = serde_json::from_str(r#"{"type":"shares"}"#).unwrap();
        assert_eq!(parsed, IpcRequest::Shares);

        let parsed: IpcRequest =
            serde_json::from_str(r#"{"type":"remove_peer","key":"10.0.0.2:8000"}"#).unwrap();
        assert_eq!(
            parsed,
            IpcRequest::RemovePeer {
                key: "10.0.0.2:8000".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_add_and_remove_peer() {
        let settings = Settings {
            default_port: 0,
            discovery_port: 0,
            ..Settings::default()
        };
        let daemon = Daemon::start(settings).await.unwrap();
        let own = format!("127.0.0.1:{}", daemon.status().await.server_addr.port());

        let resp = dispatch(&daemon, IpcRequest::AddPeer { address: own.clone() }).await;
        assert!(matches!(resp, IpcResponse::Ok { .. }));
        let IpcResponse::Peers { peers } = dispatch(&daemon, IpcRequest::Peers).await else {
            panic!("expected peers");
        };
        assert_eq!(peers.len(), 1);
        assert!(peers[0].manual);

        let resp = dispatch(&daemon, IpcRequest::RemovePeer { key: own.clone() }).await;
        assert!(matches!(resp, IpcResponse::Ok { .. }));
        let IpcResponse::Peers { peers } = dispatch(&daemon, IpcRequest::Peers).await else {
            panic!("expected peers");
        };
        assert!(peers.is_empty());

        let resp = dispatch(&daemon, IpcRequest::RemovePeer { key: own }).await;
        assert!(matches!(resp, IpcResponse::Error { .. }));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_share_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"abc").unwrap();

        let settings = Settings {
            default_port: 0,
            discovery_port: 0,
            ..Settings::default()
        };
        let daemon = Daemon::start(settings).await.unwrap();

        let resp = dispatch(
            &daemon,
            IpcRequest::Share {
                path: file.to_string_lossy().to_string(),
            },
        )
        .await;
        assert!(matches!(resp, IpcResponse::Ok { .. }));

        let IpcResponse::Shares { files } = dispatch(&daemon, IpcRequest::Shares).await else {
            panic!("expected shares");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.txt");
        assert_eq!(files[0].size, "3 B");

        let resp = dispatch(
            &daemon,
            IpcRequest::AddPeer {
                address: "not-an-address".to_string(),
            },
        )
        .await;
        assert!(matches!(resp, IpcResponse::Error { .. }));

        let resp = dispatch(
            &daemon,
            IpcRequest::Unshare {
                id: "missing".to_string(),
            },
        )
        .await;
        assert!(matches!(resp, IpcResponse::Error { .. }));

        daemon.shutdown().await;
    }
}
