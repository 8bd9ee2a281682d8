//! 访问控制与速率限制

use crate::error::{Result, ShareError};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::warn;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 自定义令牌头
pub const TOKEN_HEADER: &str = "x-access-token";

/// 共享令牌检查
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    token: Option<String>,
}

impl AccessControl {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// 生成 URL 安全的随机令牌（32 字节熵）
    pub fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// 依次从 `Authorization: Bearer`、`X-Access-Token` 和 `?token=` 读取令牌
    pub fn extract_token<'a>(
        headers: &'a HeaderMap,
        query_token: Option<&'a str>,
    ) -> Option<&'a str> {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .or_else(|| {
                headers
                    .get(TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
            })
            .or(query_token)
    }

    pub fn check(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<()> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        match Self::extract_token(headers, query_token) {
            Some(given) if constant_time_eq(given.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => Err(ShareError::Unauthorized),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 每个来源 IP 的滑动窗口限速
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// `limit` 为 0 时不限速
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn check(&self, ip: IpAddr) -> Result<()> {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = hits.entry(ip).or_default();
        while queue
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            queue.pop_front();
        }
        if queue.len() >= self.limit as usize {
            warn!("Rate limit exceeded for {}", ip);
            return Err(ShareError::TooManyRequests(ip.to_string()));
        }
        queue.push_back(now);
        Ok(())
    }

    /// 清理窗口外已无请求的 IP
    pub fn prune_at(&self, now: Instant) {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, q| {
                q.back()
                    .is_some_and(|t| now.saturating_duration_since(*t) < self.window)
            });
    }

    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }
}
