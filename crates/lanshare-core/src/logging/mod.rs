//! 访问日志
//!
//! 文件服务端点的每个请求结果（成功、拒绝、失败）都以一行 JSON 写入
//! `lanshare::access` 目标，便于用 `RUST_LOG=lanshare::access=info` 单独过滤。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// 访问日志使用的 log target
pub const ACCESS_TARGET: &str = "lanshare::access";

/// 请求结果分类
///
/// 实现了 `PartialOrd`，越靠后越严重。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Allowed,
    NotFound,
    RateLimited,
    Denied,
    Failed,
}

impl AccessOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            AccessOutcome::Allowed => "ALLOWED",
            AccessOutcome::NotFound => "NOT_FOUND",
            AccessOutcome::RateLimited => "RATE_LIMITED",
            AccessOutcome::Denied => "DENIED",
            AccessOutcome::Failed => "FAILED",
        }
    }

    /// 对应的日志级别
    pub fn level(&self) -> log::Level {
        match self {
            AccessOutcome::Allowed | AccessOutcome::NotFound => log::Level::Info,
            AccessOutcome::RateLimited | AccessOutcome::Denied => log::Level::Warn,
            AccessOutcome::Failed => log::Level::Error,
        }
    }

    /// 由响应状态码推断结果
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => AccessOutcome::Allowed,
            401 | 403 => AccessOutcome::Denied,
            404 => AccessOutcome::NotFound,
            429 => AccessOutcome::RateLimited,
            400..=499 => AccessOutcome::Denied,
            _ => AccessOutcome::Failed,
        }
    }
}

impl fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 访问日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    /// Unix 毫秒
    pub timestamp: u64,
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub outcome: AccessOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AccessLogEntry {
    pub fn new(client_ip: IpAddr, method: &str, path: &str, status: u16) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            timestamp,
            client_ip,
            method: method.to_string(),
            path: path.to_string(),
            status,
            outcome: AccessOutcome::from_status(status),
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 写入访问日志
    pub fn emit(&self) {
        log::log!(target: ACCESS_TARGET, self.outcome.level(), "{}", self.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(AccessOutcome::from_status(200), AccessOutcome::Allowed);
        assert_eq!(AccessOutcome::from_status(206), AccessOutcome::Allowed);
        assert_eq!(AccessOutcome::from_status(401), AccessOutcome::Denied);
        assert_eq!(AccessOutcome::from_status(403), AccessOutcome::Denied);
        assert_eq!(AccessOutcome::from_status(416), AccessOutcome::Denied);
        assert_eq!(AccessOutcome::from_status(404), AccessOutcome::NotFound);
        assert_eq!(AccessOutcome::from_status(429), AccessOutcome::RateLimited);
        assert_eq!(AccessOutcome::from_status(500), AccessOutcome::Failed);
        assert!(AccessOutcome::Failed > AccessOutcome::Allowed);
    }

    #[test]
    fn test_entry_json() {
        let entry = AccessLogEntry::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
            "GET",
            "/download/abc",
            403,
        )
        .with_user_agent(Some("curl/8.0"));
        let json = entry.to_json();
        assert!(json.contains("\"clientIp\":\"192.168.1.9\""));
        assert!(json.contains("\"outcome\":\"denied\""));
        assert!(json.contains("\"userAgent\":\"curl/8.0\""));

        let back: AccessLogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
