//! 下载进度
//!
//! 工作任务只做原子加法；速度和剩余时间在读取快照时计算。

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// EMA 平滑系数
const SPEED_ALPHA: f64 = 0.3;

/// 工作任务共享的字节计数器
#[derive(Debug, Default)]
pub struct ProgressCounter {
    total: AtomicU64,
    done: AtomicU64,
}

impl ProgressCounter {
    pub fn new(total: u64, already_done: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            done: AtomicU64::new(already_done),
        })
    }

    pub fn add(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// 某一时刻的进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_completed: u64,
    pub total_bytes: u64,
    /// 字节/秒
    pub speed: f64,
    #[serde(skip)]
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.bytes_completed as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// 速度估计器
#[derive(Debug)]
pub struct SpeedMeter {
    last: Option<(Instant, u64)>,
    speed: f64,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            last: None,
            speed: 0.0,
        }
    }

    pub fn sample(&mut self, counter: &ProgressCounter) -> ProgressSnapshot {
        self.sample_at(Instant::now(), counter.done(), counter.total())
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn sample_at(&mut self, now: Instant, done: u64, total: u64) -> ProgressSnapshot {
        if let Some((then, before)) = self.last {
            let elapsed = now.saturating_duration_since(then).as_secs_f64();
            if elapsed > 0.0 {
                let instant = done.saturating_sub(before) as f64 / elapsed;
                self.speed = if self.speed == 0.0 {
                    instant
                } else {
                    SPEED_ALPHA * instant + (1.0 - SPEED_ALPHA) * self.speed
                };
            }
        }
        self.last = Some((now, done));

        let remaining = total.saturating_sub(done);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if self.speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / self.speed))
        } else {
            None
        };
        ProgressSnapshot {
            bytes_completed: done,
            total_bytes: total,
            speed: self.speed,
            eta,
        }
    }
}
