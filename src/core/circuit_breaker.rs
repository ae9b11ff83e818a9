//! 熔断器：按依赖名隔离的快速失败
//!
//! 跳闸判断只看连续失败 / 连续成功计数；滑动窗口只用于统计展示。
//! 打开期间 call 不会调用被包裹的函数，直接返回 CIRCUIT_BREAKER_OPEN（携带剩余冷却时间）。
//! 冷却结束后进入 half_open，同一时刻只放行一个探测调用。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::TaskError;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_COOL_DOWN_SECS: u64 = 60;
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// 熔断器配置
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// half_open 下连续成功多少次后关闭
    pub success_threshold: u32,
    pub cool_down: Duration,
    /// 最近调用结果窗口（仅统计）
    pub window_size: usize,
}

impl BreakerConfig {
    pub const fn new() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cool_down: Duration::from_secs(DEFAULT_COOL_DOWN_SECS),
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    #[must_use]
    pub const fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// 单个熔断器的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// 窗口内的调用数 / 失败数
    pub window_calls: usize,
    pub window_failures: usize,
    pub success_rate: f64,
    pub trips: u64,
    /// 最近一次跳闸时间（毫秒时间戳）
    pub last_trip_at: Option<i64>,
    /// 剩余冷却时间（毫秒），仅 open 时有值
    pub retry_after_ms: Option<u64>,
}

#[derive(Default)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_trip_at: Option<i64>,
    trips: u64,
    /// true = 成功
    history: VecDeque<bool>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// open 且冷却结束时切到 half_open
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.cool_down)
            .unwrap_or(true);
        if cooled {
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.trial_in_flight = false;
            tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing dependency");
        }
    }

    fn remaining(&self, inner: &BreakerInner) -> Duration {
        inner
            .opened_at
            .map(|at| self.config.cool_down.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    /// 当前状态（按需完成 open → half_open 的惰性切换）
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// 经熔断器调用 f；打开时不调用 f
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let _trial = self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(),
            // 非法输入不说明依赖不健康
            Err(e) if e.is_fatal() => {}
            Err(_) => self.on_failure(),
        }
        result
    }

    fn admit(&self) -> Result<TrialGuard<'_>, TaskError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(TrialGuard {
                breaker: self,
                trial: false,
            }),
            BreakerState::Open => Err(TaskError::breaker_open(&self.name, self.remaining(&inner))),
            BreakerState::HalfOpen if inner.trial_in_flight => {
                Err(TaskError::breaker_open(&self.name, Duration::ZERO))
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(TrialGuard {
                    breaker: self,
                    trial: true,
                })
            }
        }
    }

    fn push_history(&self, inner: &mut BreakerInner, ok: bool) {
        inner.history.push_back(ok);
        while inner.history.len() > self.config.window_size.max(1) {
            inner.history.pop_front();
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        self.push_history(&mut inner, true);
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = BreakerState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "Circuit breaker closed");
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        self.push_history(&mut inner, false);
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.trip(&mut inner);
            }
            BreakerState::HalfOpen => self.trip(&mut inner),
            _ => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.last_trip_at = Some(chrono::Utc::now().timestamp_millis());
        inner.trips += 1;
        inner.consecutive_successes = 0;
        tracing::warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            cool_down_secs = self.config.cool_down.as_secs_f64(),
            "Circuit breaker opened"
        );
    }

    /// 回到 closed 并清空计数
    pub fn reset(&self) {
        let mut inner = self.lock();
        let trips = inner.trips;
        let last_trip_at = inner.last_trip_at;
        *inner = BreakerInner {
            trips,
            last_trip_at,
            ..BreakerInner::default()
        };
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// 运维手动打开
    pub fn force_open(&self) {
        let mut inner = self.lock();
        self.trip(&mut inner);
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let window_calls = inner.history.len();
        let window_failures = inner.history.iter().filter(|ok| !**ok).count();
        let success_rate = if window_calls == 0 {
            1.0
        } else {
            (window_calls - window_failures) as f64 / window_calls as f64
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            window_calls,
            window_failures,
            success_rate,
            trips: inner.trips,
            last_trip_at: inner.last_trip_at,
            retry_after_ms: (inner.state == BreakerState::Open)
                .then(|| self.remaining(&inner).as_millis() as u64),
        }
    }
}

/// half_open 探测名额；调用 future 被 drop 时同样归还
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// 熔断器注册表：按依赖名惰性创建，互不影响
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, self.default_config)
    }

    /// 已存在时忽略 config，返回原熔断器
    pub fn get_with_config(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats_all(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
