//! 连接活动跟踪
//!
//! 记录访问过文件服务端点的对端。超过 [`ACTIVITY_WINDOW`] 没有新请求的对端
//! 在下一次 [`ConnectionTracker::sweep`] 时被移除。

use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// 不活跃窗口
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// 每个对端保留的历史记录条数
pub const HISTORY_LIMIT: usize = 32;

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    List,
    Preview,
    Download,
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    /// Unix 秒
    pub timestamp: u64,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// 对外暴露的连接快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub peer_address: IpAddr,
    /// Unix 秒
    pub first_seen: u64,
    pub last_seen: u64,
    pub action_history: Vec<ActionEntry>,
}

/// 活动通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    NewPeer(IpAddr),
    Expired(IpAddr),
}

struct Tracked {
    first_seen: Instant,
    last_seen: Instant,
    first_seen_wall: u64,
    last_seen_wall: u64,
    history: VecDeque<ActionEntry>,
}

/// 连接跟踪器
pub struct ConnectionTracker {
    window: Duration,
    connections: Mutex<HashMap<IpAddr, Tracked>>,
    events: broadcast::Sender<ActivityEvent>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(ACTIVITY_WINDOW)
    }
}

impl ConnectionTracker {
    pub fn new(window: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            window,
            connections: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// 订阅新对端/过期通知
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    pub fn record_access(&self, addr: IpAddr, kind: ActionKind, file_id: Option<&str>) {
        self.record_access_at(addr, kind, file_id, Instant::now());
    }

    pub fn record_access_at(
        &self,
        addr: IpAddr,
        kind: ActionKind,
        file_id: Option<&str>,
        now: Instant,
    ) {
        let wall = unix_now();
        let entry = ActionEntry {
            timestamp: wall,
            kind,
            file_id: file_id.map(str::to_string),
        };

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let is_new = !connections.contains_key(&addr);
        let tracked = connections.entry(addr).or_insert_with(|| Tracked {
            first_seen: now,
            last_seen: now,
            first_seen_wall: wall,
            last_seen_wall: wall,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        });
        tracked.last_seen = tracked.last_seen.max(now);
        tracked.last_seen_wall = wall;
        if tracked.history.len() == HISTORY_LIMIT {
            tracked.history.pop_front();
        }
        tracked.history.push_back(entry);
        drop(connections);

        if is_new {
            info!("New connection from {}", addr);
            // 没有订阅者时发送失败，忽略
            let _ = self.events.send(ActivityEvent::NewPeer(addr));
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count_at(Instant::now())
    }

    /// 窗口内有活动的对端数量（不依赖 sweep 是否已执行）
    pub fn active_count_at(&self, now: Instant) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| now.saturating_duration_since(t.last_seen) <= self.window)
            .count()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// 移除超过窗口未活动的对端，返回移除数量
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|addr, t| {
                let keep = now.saturating_duration_since(t.last_seen) <= self.window;
                if !keep {
                    expired.push(*addr);
                }
                keep
            });
        for addr in &expired {
            debug!(
                "Connection {} inactive for {:?}, removing",
                addr, self.window
            );
            let _ = self.events.send(ActivityEvent::Expired(*addr));
        }
        expired.len()
    }

    /// 按最近活动时间倒序的快照
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<(Instant, Instant, ConnectionRecord)> = connections
            .iter()
            .map(|(addr, t)| {
                (
                    t.last_seen,
                    t.first_seen,
                    ConnectionRecord {
                        peer_address: *addr,
                        first_seen: t.first_seen_wall,
                        last_seen: t.last_seen_wall,
                        action_history: t.history.iter().cloned().collect(),
                    },
                )
            })
            .collect();
        drop(connections);
        records.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        records.into_iter().map(|(_, _, r)| r).collect()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_record_and_count() {
        let tracker = ConnectionTracker::default();
        let now = Instant::now();
        tracker.record_access_at(ip(2), ActionKind::List, None, now);
        tracker.record_access_at(ip(2), ActionKind::Download, Some("abc"), now);
        tracker.record_access_at(ip(3), ActionKind::Preview, Some("def"), now);
        assert_eq!(tracker.active_count_at(now), 2);

        let snapshot = tracker.snapshot();
        let two = snapshot.iter().find(|r| r.peer_address == ip(2)).unwrap();
        assert_eq!(two.action_history.len(), 2);
        assert_eq!(two.action_history[1].file_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_connection_expiry() {
        let tracker = ConnectionTracker::default();
        let start = Instant::now();
        tracker.record_access_at(ip(2), ActionKind::List, None, start);

        let later = start + ACTIVITY_WINDOW + Duration::from_secs(1);
        // 未 sweep 时也不再计入活跃数
        assert_eq!(tracker.active_count_at(later), 0);
        assert_eq!(tracker.sweep_at(later), 1);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_recent_activity_keeps_peer() {
        let tracker = ConnectionTracker::default();
        let start = Instant::now();
        tracker.record_access_at(ip(2), ActionKind::List, None, start);
        let mid = start + Duration::from_secs(200);
        tracker.record_access_at(ip(2), ActionKind::Download, Some("x"), mid);

        let later = start + ACTIVITY_WINDOW + Duration::from_secs(1);
        assert_eq!(tracker.sweep_at(later), 0);
        assert_eq!(tracker.active_count_at(later), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = ConnectionTracker::default();
        let now = Instant::now();
        for i in 0..100 {
            let id = format!("file-{i}");
            tracker.record_access_at(ip(9), ActionKind::Download, Some(&id), now);
        }
        let snapshot = tracker.snapshot();
        let history = &snapshot[0].action_history;
        assert_eq!(history.len(), HISTORY_LIMIT);
        // 保留最新的记录
        assert_eq!(history.last().unwrap().file_id.as_deref(), Some("file-99"));
        assert_eq!(history[0].file_id.as_deref(), Some("file-68"));
    }

    #[tokio::test]
    async fn test_activity_events() {
        let tracker = ConnectionTracker::default();
        let mut rx = tracker.subscribe();
        let start = Instant::now();

        tracker.record_access_at(ip(4), ActionKind::List, None, start);
        tracker.record_access_at(ip(4), ActionKind::List, None, start);
        tracker.sweep_at(start + ACTIVITY_WINDOW * 2);

        assert_eq!(rx.recv().await.unwrap(), ActivityEvent::NewPeer(ip(4)));
        assert_eq!(rx.recv().await.unwrap(), ActivityEvent::Expired(ip(4)));
        assert!(rx.try_recv().is_err());
    }
}
