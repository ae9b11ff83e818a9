//! 错误统计：按错误码 / 类别 / 严重程度计数，滑动窗口内的错误率与告警

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::TaskError;

/// 最近一次错误的摘要
#[derive(Debug, Clone, Serialize)]
pub struct TrackedError {
    pub task_id: String,
    pub code: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub timestamp: i64,
}

/// 统计汇总
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSummary {
    pub total: u64,
    pub by_code: HashMap<String, u64>,
    pub by_kind: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub recent: Vec<TrackedError>,
    /// 窗口内错误数
    pub window_count: usize,
    /// 每分钟错误数（按窗口折算）
    pub rate_per_minute: f64,
    pub alerting: bool,
}

#[derive(Default)]
struct TrackerInner {
    total: u64,
    by_code: HashMap<String, u64>,
    by_kind: HashMap<String, u64>,
    by_severity: HashMap<String, u64>,
    recent: VecDeque<TrackedError>,
    window: VecDeque<Instant>,
    alerting: bool,
}

pub struct ErrorTracker {
    recent_capacity: usize,
    alert_threshold: usize,
    alert_window: Duration,
    inner: Mutex<TrackerInner>,
}

impl ErrorTracker {
    pub fn new(recent_capacity: usize, alert_threshold: usize, alert_window: Duration) -> Self {
        Self {
            recent_capacity: recent_capacity.max(1),
            alert_threshold: alert_threshold.max(1),
            alert_window,
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    fn prune(&self, inner: &mut TrackerInner, now: Instant) {
        while let Some(front) = inner.window.front() {
            if now.duration_since(*front) > self.alert_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// 记录一次失败；返回本次是否触发了告警
    pub fn record(&self, task_id: &str, err: &TaskError) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total += 1;
        *inner.by_code.entry(err.code.clone()).or_default() += 1;
        *inner.by_kind.entry(err.kind.as_str().to_string()).or_default() += 1;
        *inner
            .by_severity
            .entry(err.severity.as_str().to_string())
            .or_default() += 1;

        inner.recent.push_back(TrackedError {
            task_id: task_id.to_string(),
            code: err.code.clone(),
            kind: err.kind.as_str().to_string(),
            severity: err.severity.as_str().to_string(),
            message: err.message.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        while inner.recent.len() > self.recent_capacity {
            inner.recent.pop_front();
        }

        inner.window.push_back(now);
        self.prune(&mut inner, now);

        let over = inner.window.len() >= self.alert_threshold;
        if over && !inner.alerting {
            inner.alerting = true;
            tracing::warn!(
                count = inner.window.len(),
                window_secs = self.alert_window.as_secs(),
                "ALERT: high error rate detected"
            );
            return true;
        }
        if !over {
            inner.alerting = false;
        }
        false
    }

    pub fn summary(&self) -> TrackerSummary {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut inner, now);
        let window_count = inner.window.len();
        if window_count < self.alert_threshold {
            inner.alerting = false;
        }
        let minutes = self.alert_window.as_secs_f64() / 60.0;
        TrackerSummary {
            total: inner.total,
            by_code: inner.by_code.clone(),
            by_kind: inner.by_kind.clone(),
            by_severity: inner.by_severity.clone(),
            recent: inner.recent.iter().rev().take(10).cloned().collect(),
            window_count,
            rate_per_minute: if minutes > 0.0 {
                window_count as f64 / minutes
            } else {
                0.0
            },
            alerting: inner.alerting,
        }
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(100, 10, Duration::from_secs(60))
    }
}
