//! 局域网对端发现
//!
//! 每个实例在 UDP 端口上周期性广播 [`Announcement`]，同时监听其他实例的广播。
//! 一个套接字同时用于发送和接收，三个后台任务：
//!
//! - 广播：每 `announce_interval` 向 `255.255.255.255:port` 发送一次
//! - 监听：解析报文并更新 [`PeerTable`]
//! - 清理：每 `sweep_interval` 移除静默超过 TTL 的对端
//!
//! 生命周期为 `Stopped -> Running -> Stopped`，可以重复启动。

pub mod packet;
pub mod peers;

pub use packet::{Announcement, MAX_PACKET_SIZE, PROTOCOL_VERSION, PacketError};
pub use peers::{PeerRecord, PeerTable};

use crate::config::Settings;
use crate::error::{Result, ShareError};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 发现服务配置
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub instance_id: String,
    pub display_name: String,
    /// 本实例文件服务端口（写入广播）
    pub service_port: u16,
    /// UDP 监听地址
    pub bind_addr: SocketAddr,
    /// 广播目标
    pub announce_target: SocketAddr,
    pub announce_interval: Duration,
    pub sweep_interval: Duration,
    pub peer_ttl: Duration,
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &Settings, service_port: u16) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            display_name: settings.device_name.clone(),
            service_port,
            bind_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                settings.discovery_port,
            ),
            announce_target: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                settings.discovery_port,
            ),
            announce_interval: settings.announce_interval(),
            sweep_interval: settings.announce_interval(),
            peer_ttl: settings.peer_ttl(),
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// 发现服务
pub struct DiscoveryService {
    config: DiscoveryConfig,
    peers: Arc<PeerTable>,
    running: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        let peers = Arc::new(PeerTable::new(config.peer_ttl));
        Self {
            config,
            peers,
            running: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn peer_table(&self) -> Arc<PeerTable> {
        self.peers.clone()
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.list()
    }

    /// 移除对端，`key` 为实例 ID 或 `ip:port`
    pub fn remove_peer(&self, key: &str) -> Option<PeerRecord> {
        self.peers.forget(key)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// 实际绑定的地址（未运行时为 `None`）
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// 启动广播、监听和清理任务
    ///
    /// 已在运行时直接返回当前地址。
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let bind = self.config.bind_addr;
        let socket = UdpSocket::bind(bind).await.map_err(|source| ShareError::Bind {
            addr: bind.to_string(),
            source,
        })?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(announce_loop(
                socket.clone(),
                self.config.clone(),
                cancel.clone(),
            )),
            tokio::spawn(listen_loop(
                socket,
                self.config.instance_id.clone(),
                self.peers.clone(),
                cancel.clone(),
            )),
            tokio::spawn(sweep_loop(
                self.peers.clone(),
                self.config.sweep_interval,
                cancel.clone(),
            )),
        ];

        info!(
            "Discovery running on {} as {} ({})",
            local_addr, self.config.display_name, self.config.instance_id
        );
        *running = Some(Running {
            local_addr,
            cancel,
            tasks,
        });
        Ok(local_addr)
    }

    /// 停止所有后台任务并关闭套接字
    pub async fn stop(&self) {
        let Some(r) = self.running.lock().await.take() else {
            return;
        };
        r.cancel.cancel();
        for task in r.tasks {
            let _ = task.await;
        }
        info!("Discovery stopped");
    }

    /// 先用 TCP 连接确认手动输入的对端可达，成功后加入对端表
    pub async fn connect_peer(&self, addr: SocketAddr, timeout: Duration) -> Result<PeerRecord> {
        check_reachable(addr, timeout).await?;
        Ok(self.peers.insert_manual(addr, &addr.to_string()))
    }
}

/// 在 `timeout` 内能否建立 TCP 连接
pub async fn check_reachable(addr: SocketAddr, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            debug!("Peer {} is reachable", addr);
            Ok(())
        }
        Ok(Err(e)) => Err(ShareError::transport(format!("connect {addr}: {e}"))),
        Err(_) => Err(ShareError::transport(format!(
            "connect {addr}: timed out after {timeout:?}"
        ))),
    }
}

async fn announce_loop(socket: Arc<UdpSocket>, config: DiscoveryConfig, cancel: CancellationToken) {
    let service_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.service_port);
    let payload =
        Announcement::new(&config.instance_id, &config.display_name, service_addr).encode();
    let mut interval = tokio::time::interval(config.announce_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&payload, config.announce_target).await {
                    // 无网络时广播失败，下一轮重试
                    warn!("Announce to {} failed: {}", config.announce_target, e);
                }
            }
        }
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    own_id: String,
    peers: Arc<PeerTable>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, source) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    debug!("Discovery recv error: {}", e);
                    continue;
                }
            },
        };
        handle_datagram(&buf[..len], source, &own_id, &peers);
    }
}

/// 处理一个收到的报文
pub(crate) fn handle_datagram(bytes: &[u8], source: SocketAddr, own_id: &str, peers: &PeerTable) {
    let announcement = match Announcement::decode(bytes) {
        Ok(a) => a,
        Err(e) => {
            debug!("Ignoring datagram from {}: {}", source, e);
            return;
        }
    };
    if announcement.instance_id == own_id {
        return;
    }
    match announcement.resolve_service_addr(source) {
        Ok(addr) => {
            peers.upsert_at(
                &announcement.instance_id,
                addr,
                &announcement.display_name,
                announcement.protocol_version,
                std::time::Instant::now(),
            );
        }
        Err(e) => debug!("Ignoring announcement from {}: {}", source, e),
    }
}

async fn sweep_loop(peers: Arc<PeerTable>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                peers.sweep();
            }
        }
    }
}
