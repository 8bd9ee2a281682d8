//! Core Service - 文件服务、发现和连接跟踪

use anyhow::Result;
use lanshare_core::share::FolderSummary;
use lanshare_core::{
    ActivityEvent, ConnectionRecord, ConnectionTracker, DiscoveryConfig, DiscoveryService,
    FileServer, PeerRecord, ServerHandle, Settings, ShareEntry, ShareRegistry,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 连接跟踪器的清理周期
const TRACKER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// 守护进程状态摘要
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub device_name: String,
    pub instance_id: String,
    pub server_addr: SocketAddr,
    pub discovery_addr: Option<SocketAddr>,
    pub shared_files: usize,
    pub shared_bytes: u64,
    pub active_connections: usize,
    pub peers: usize,
}

/// 一个运行中的实例
pub struct Daemon {
    settings: Settings,
    registry: Arc<ShareRegistry>,
    tracker: Arc<ConnectionTracker>,
    discovery: DiscoveryService,
    server: Mutex<Option<ServerHandle>>,
    server_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// 加载共享路径并启动所有组件
    ///
    /// HTTP 端口绑定失败是致命的；发现端口绑定失败只记录日志。
    pub async fn start(settings: Settings) -> Result<Self> {
        tracing::info!("核心服务初始化...");

        let registry = Arc::new(ShareRegistry::new(&settings));
        for path in &settings.share_paths {
            match registry.add_path(path) {
                Ok(summary) => tracing::info!(
                    "Shared {:?}: {} added, {} skipped",
                    path,
                    summary.added,
                    summary.skipped
                ),
                Err(e) => tracing::warn!("Cannot share {:?}: {}", path, e),
            }
        }

        let tracker = Arc::new(ConnectionTracker::default());
        let server = FileServer::new(&settings, registry.clone(), tracker.clone());
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.default_port);
        let handle = server.start(bind).await?;
        let server_addr = handle.local_addr();

        let discovery =
            DiscoveryService::new(DiscoveryConfig::from_settings(&settings, server_addr.port()));
        if let Err(e) = discovery.start().await {
            tracing::warn!("Discovery unavailable, continuing without it: {}", e);
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(sweep_tracker(tracker.clone(), cancel.clone())),
            tokio::spawn(log_activity(tracker.subscribe(), cancel.clone())),
        ];

        tracing::info!(
            "设备 {} 已就绪: http://{} ({} 个共享文件)",
            settings.device_name,
            server_addr,
            registry.len()
        );

        Ok(Self {
            settings,
            registry,
            tracker,
            discovery,
            server: Mutex::new(Some(handle)),
            server_addr,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            device_name: self.settings.device_name.clone(),
            instance_id: self.discovery.instance_id().to_string(),
            server_addr: self.server_addr,
            discovery_addr: self.discovery.local_addr().await,
            shared_files: self.registry.len(),
            shared_bytes: self.registry.total_bytes(),
            active_connections: self.tracker.active_count(),
            peers: self.discovery.list_peers().len(),
        }
    }

    pub fn share(&self, path: &Path) -> lanshare_core::Result<FolderSummary> {
        self.registry.add_path(path)
    }

    pub fn unshare(&self, id: &str) -> Option<ShareEntry> {
        self.registry.remove(id)
    }

    pub fn shares(&self) -> Vec<ShareEntry> {
        self.registry.entries()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.discovery.list_peers()
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.tracker.snapshot()
    }

    /// 手动添加对端：先确认 TCP 可达
    pub async fn add_peer(&self, addr: SocketAddr) -> lanshare_core::Result<PeerRecord> {
        self.discovery
            .connect_peer(addr, self.settings.connect_timeout())
            .await
    }

    /// 移除对端，`key` 为实例 ID 或 `ip:port`
    pub fn remove_peer(&self, key: &str) -> Option<PeerRecord> {
        self.discovery.remove_peer(key)
    }

    /// 停止后台任务、发现服务和 HTTP 服务
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        self.discovery.stop().await;
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        tracing::info!("核心服务已停止");
    }
}

async fn sweep_tracker(tracker: Arc<ConnectionTracker>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(TRACKER_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                tracker.sweep();
            }
        }
    }
}

async fn log_activity(mut events: broadcast::Receiver<ActivityEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ActivityEvent::NewPeer(ip)) => tracing::info!("新连接: {}", ip),
            Ok(ActivityEvent::Expired(ip)) => tracing::info!("连接过期: {}", ip),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Activity log lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(share: &Path) -> Settings {
        Settings {
            device_name: "test-box".to_string(),
            default_port: 0,
            discovery_port: 0,
            share_paths: vec![share.to_path_buf()],
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_start_shares_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"world!").unwrap();

        let daemon = Daemon::start(test_settings(dir.path())).await.unwrap();
        let status = daemon.status().await;
        assert_eq!(status.device_name, "test-box");
        assert_eq!(status.shared_files, 2);
        assert_eq!(status.shared_bytes, 11);
        assert_ne!(status.server_addr.port(), 0);
        assert_eq!(status.active_connections, 0);

        let id = daemon.shares()[0].id.clone();
        assert!(daemon.unshare(&id).is_some());
        assert_eq!(daemon.shares().len(), 1);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_peer_connects_to_server() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::start(test_settings(dir.path())).await.unwrap();
        let own = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            daemon.status().await.server_addr.port(),
        );

        let peer = daemon.add_peer(own).await.unwrap();
        assert!(peer.manual);
        assert_eq!(daemon.peers().len(), 1);

        assert!(daemon.remove_peer(&peer.instance_id).is_some());
        assert!(daemon.peers().is_empty());
        assert!(daemon.remove_peer(&peer.instance_id).is_none());

        daemon.shutdown().await;
    }
}
