//! 对端表

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub instance_id: String,
    pub address: SocketAddr,
    pub display_name: String,
    pub protocol_version: u32,
    /// 手动添加的对端不会因超时被移除
    pub manual: bool,
    /// Unix 秒
    pub last_seen_unix: u64,
    #[serde(skip)]
    pub last_seen: Instant,
}

/// 以实例 ID 为键的对端集合
pub struct PeerTable {
    ttl: Duration,
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 插入或刷新一个广播发现的对端，返回是否为新对端
    pub fn upsert_at(
        &self,
        instance_id: &str,
        address: SocketAddr,
        display_name: &str,
        protocol_version: u32,
        now: Instant,
    ) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        // 同一地址的手动记录被广播记录取代
        peers.retain(|_, p| !(p.manual && p.address == address));

        let record = PeerRecord {
            instance_id: instance_id.to_string(),
            address,
            display_name: display_name.to_string(),
            protocol_version,
            manual: false,
            last_seen_unix: unix_now(),
            last_seen: now,
        };
        let is_new = peers.insert(instance_id.to_string(), record).is_none();
        drop(peers);

        if is_new {
            info!("Discovered peer {} at {}", display_name, address);
        }
        is_new
    }

    /// 手动添加的对端
    pub fn insert_manual(&self, address: SocketAddr, display_name: &str) -> PeerRecord {
        let record = PeerRecord {
            instance_id: format!("manual:{address}"),
            address,
            display_name: display_name.to_string(),
            protocol_version: super::PROTOCOL_VERSION,
            manual: true,
            last_seen_unix: unix_now(),
            last_seen: Instant::now(),
        };
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.instance_id.clone(), record.clone());
        info!("Added manual peer {}", address);
        record
    }

    /// 按实例 ID 或 `ip:port` 移除对端
    pub fn forget(&self, key: &str) -> Option<PeerRecord> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = peers.remove(key) {
            info!("Removed peer {} ({})", record.display_name, record.address);
            return Some(record);
        }
        let address: SocketAddr = key.parse().ok()?;
        let id = peers
            .values()
            .find(|p| p.address == address)
            .map(|p| p.instance_id.clone())?;
        let record = peers.remove(&id)?;
        info!("Removed peer {} ({})", record.display_name, record.address);
        Some(record)
    }

    pub fn sweep(&self) -> Vec<PeerRecord> {
        self.sweep_at(Instant::now())
    }

    /// 移除静默超过 TTL 的对端
    pub fn sweep_at(&self, now: Instant) -> Vec<PeerRecord> {
        let mut removed = Vec::new();
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, p| {
                let keep = p.manual || now.saturating_duration_since(p.last_seen) <= self.ttl;
                if !keep {
                    removed.push(p.clone());
                }
                keep
            });
        for p in &removed {
            debug!("Peer {} ({}) expired", p.display_name, p.address);
        }
        removed
    }

    /// 按显示名、地址排序的快照
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.address.cmp(&b.address))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
