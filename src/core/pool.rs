//! 设备池：有界并发的执行目标分配
//!
//! Semaphore 限制同时被占用的设备数；设备选择先看 preferred，再轮询（round robin）分散负载。
//! acquire 返回 RAII 的 TargetLease：显式 release 或被 drop（任务取消）时都会且只会归还一次。
//! 健康状态与占用状态相互独立：使用中被标记为 unhealthy 的设备归还后仍回到空闲集合，只是暂不参与选择。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};

use crate::core::TaskError;

/// 设备状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Available,
    Busy,
    /// 连续失败过多，暂不参与分配
    Unhealthy,
    Offline,
}

/// 一个可分配的执行目标（设备 / 模拟器槽位）
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionTarget {
    pub id: String,
    /// android / ios
    pub platform: String,
    pub status: TargetStatus,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    /// 调用耗时的指数滑动平均（毫秒）
    pub avg_latency_ms: f64,
    /// 最近一次归还时间（毫秒时间戳）
    pub last_used_at: Option<i64>,
}

impl ExecutionTarget {
    pub fn new(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            status: TargetStatus::Available,
            success_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            avg_latency_ms: 0.0,
            last_used_at: None,
        }
    }
}

/// 设备池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 同时被占用的设备上限
    pub max_concurrent: usize,
    /// acquire 未指定等待预算时的默认值
    pub acquire_timeout: Duration,
    /// 连续失败多少次后标记为 unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            acquire_timeout: Duration::from_secs(30),
            unhealthy_threshold: 5,
        }
    }
}

/// 设备池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub offline: usize,
    pub max_concurrent: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

struct Slot {
    target: ExecutionTarget,
    allocated: bool,
    /// 被标记为 unhealthy 的时刻
    unhealthy_since: Option<Instant>,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    /// 轮询游标：下一次从这里开始找空闲设备
    cursor: usize,
}

impl PoolInner {
    fn selectable(&self, i: usize) -> bool {
        let slot = &self.slots[i];
        !slot.allocated && slot.target.status == TargetStatus::Available
    }

    fn take(&mut self, i: usize) -> (String, String) {
        let slot = &mut self.slots[i];
        slot.allocated = true;
        slot.target.status = TargetStatus::Busy;
        (slot.target.id.clone(), slot.target.platform.clone())
    }
}

/// 设备池：所有可变状态都在一个临界区内修改
pub struct TargetPool {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    /// 设备归还 / 恢复可用时唤醒等待者
    released: Notify,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

impl TargetPool {
    pub fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            inner: Mutex::new(PoolInner::default()),
            released: Notify::new(),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册设备；重复的 id 返回 validation 错误
    pub fn register(&self, target: ExecutionTarget) -> Result<(), TaskError> {
        let mut inner = self.lock();
        if inner.index.contains_key(&target.id) {
            return Err(TaskError::validation(format!(
                "target '{}' is already registered",
                target.id
            )));
        }
        tracing::info!(
            target_id = %target.id,
            platform = %target.platform,
            "Registered execution target"
        );
        let i = inner.slots.len();
        inner.index.insert(target.id.clone(), i);
        inner.slots.push(Slot {
            target,
            allocated: false,
            unhealthy_since: None,
        });
        drop(inner);
        self.released.notify_waiters();
        Ok(())
    }

    /// 分配一个设备；在 wait 预算内拿不到并发槽位或空闲设备时返回 None（背压信号，不是错误）
    pub async fn acquire(
        self: &Arc<Self>,
        preferred: Option<&str>,
        wait: Duration,
    ) -> Option<TargetLease> {
        let deadline = Instant::now() + wait;
        let permit = match timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                tracing::debug!("No concurrency slot within {}ms", wait.as_millis());
                return None;
            }
        };

        loop {
            // 先登记唤醒，再检查，避免检查与等待之间错过归还通知
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((id, platform)) = self.try_take(preferred) {
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target_id = %id, "Acquired execution target");
                return Some(TargetLease {
                    pool: Arc::clone(self),
                    target_id: id,
                    platform,
                    permit: Some(permit),
                    released: false,
                });
            }

            if timeout_at(deadline, notified).await.is_err() {
                tracing::debug!("No execution target available within {}ms", wait.as_millis());
                return None;
            }
        }
    }

    fn try_take(&self, preferred: Option<&str>) -> Option<(String, String)> {
        let mut inner = self.lock();
        if let Some(i) = preferred.and_then(|id| inner.index.get(id).copied()) {
            if inner.selectable(i) {
                return Some(inner.take(i));
            }
        }
        let n = inner.slots.len();
        for offset in 0..n {
            let i = (inner.cursor + offset) % n;
            if inner.selectable(i) {
                inner.cursor = (i + 1) % n;
                return Some(inner.take(i));
            }
        }
        None
    }

    /// 显式归还设备（消费 lease，不可能重复归还）
    pub fn release(&self, mut lease: TargetLease) {
        if !std::ptr::eq(Arc::as_ptr(&lease.pool), self) {
            tracing::warn!(
                target_id = %lease.target_id,
                "Lease returned to a foreign pool, releasing to its owner"
            );
        }
        lease.release_now();
    }

    fn release_inner(&self, id: &str) {
        let mut inner = self.lock();
        let Some(i) = inner.index.get(id).copied() else {
            tracing::warn!(target_id = %id, "Release of unknown target ignored");
            return;
        };
        let slot = &mut inner.slots[i];
        if !slot.allocated {
            tracing::warn!(target_id = %id, "Release of a target that is not allocated ignored");
            return;
        }
        slot.allocated = false;
        if slot.target.status == TargetStatus::Busy {
            slot.target.status = TargetStatus::Available;
        }
        slot.target.last_used_at = Some(chrono::Utc::now().timestamp_millis());
        drop(inner);

        self.released_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target_id = %id, "Released execution target");
        self.released.notify_waiters();
    }

    /// 记录一次成功调用：重置连续失败计数并更新延迟均值
    pub fn record_success(&self, id: &str, latency: Duration) {
        let mut inner = self.lock();
        let Some(i) = inner.index.get(id).copied() else {
            return;
        };
        let slot = &mut inner.slots[i];
        let t = &mut slot.target;
        t.success_count += 1;
        t.consecutive_errors = 0;
        let ms = latency.as_secs_f64() * 1000.0;
        t.avg_latency_ms = if t.avg_latency_ms == 0.0 {
            ms
        } else {
            t.avg_latency_ms * 0.8 + ms * 0.2
        };
        if t.status == TargetStatus::Unhealthy {
            slot.unhealthy_since = None;
            t.status = if slot.allocated {
                TargetStatus::Busy
            } else {
                TargetStatus::Available
            };
            tracing::info!(target_id = %id, "Execution target recovered");
        }
    }

    /// 记录一次失败调用；连续失败达到阈值时标记为 unhealthy
    pub fn record_failure(&self, id: &str) {
        let threshold = self.config.unhealthy_threshold;
        let mut inner = self.lock();
        let Some(i) = inner.index.get(id).copied() else {
            return;
        };
        let slot = &mut inner.slots[i];
        let t = &mut slot.target;
        t.error_count += 1;
        t.consecutive_errors += 1;
        if t.consecutive_errors >= threshold
            && matches!(t.status, TargetStatus::Available | TargetStatus::Busy)
        {
            t.status = TargetStatus::Unhealthy;
            slot.unhealthy_since = Some(Instant::now());
            tracing::warn!(
                target_id = %id,
                consecutive_errors = t.consecutive_errors,
                "Execution target marked unhealthy"
            );
        }
    }

    /// 外部健康探测设置状态；Available / Busy 由占用情况决定，传入任一都表示「健康」
    pub fn set_status(&self, id: &str, status: TargetStatus) -> bool {
        let mut inner = self.lock();
        let Some(i) = inner.index.get(id).copied() else {
            return false;
        };
        let slot = &mut inner.slots[i];
        slot.unhealthy_since = match status {
            TargetStatus::Unhealthy => slot.unhealthy_since.or_else(|| Some(Instant::now())),
            _ => None,
        };
        slot.target.status = match status {
            TargetStatus::Available | TargetStatus::Busy => {
                slot.target.consecutive_errors = 0;
                if slot.allocated {
                    TargetStatus::Busy
                } else {
                    TargetStatus::Available
                }
            }
            other => other,
        };
        drop(inner);
        self.released.notify_waiters();
        true
    }

    /// 空闲且已 unhealthy 超过 min_age 的设备（健康探测的候选）
    pub fn unhealthy_targets(&self, min_age: Duration) -> Vec<ExecutionTarget> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .filter(|s| !s.allocated && s.target.status == TargetStatus::Unhealthy)
            .filter(|s| s.unhealthy_since.is_some_and(|since| since.elapsed() >= min_age))
            .map(|s| s.target.clone())
            .collect()
    }

    /// 探测通过后重新接纳 unhealthy 设备
    ///
    /// 类似熔断器 half-open：连续失败计数停在阈值减一，再失败一次就重新标记为 unhealthy，
    /// 成功一次则完全恢复。
    pub fn readmit(&self, id: &str) -> bool {
        let threshold = self.config.unhealthy_threshold;
        let mut inner = self.lock();
        let Some(i) = inner.index.get(id).copied() else {
            return false;
        };
        let slot = &mut inner.slots[i];
        if slot.target.status != TargetStatus::Unhealthy {
            return false;
        }
        slot.unhealthy_since = None;
        slot.target.consecutive_errors = threshold.saturating_sub(1);
        slot.target.status = if slot.allocated {
            TargetStatus::Busy
        } else {
            TargetStatus::Available
        };
        drop(inner);
        tracing::info!(target_id = %id, "Execution target readmitted after health check");
        self.released.notify_waiters();
        true
    }

    /// 设备快照
    pub fn target(&self, id: &str) -> Option<ExecutionTarget> {
        let inner = self.lock();
        inner.index.get(id).map(|&i| inner.slots[i].target.clone())
    }

    /// 所有设备快照（按注册顺序）
    pub fn targets(&self) -> Vec<ExecutionTarget> {
        self.lock().slots.iter().map(|s| s.target.clone()).collect()
    }

    /// 当前被占用的设备数
    pub fn busy_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.allocated).count()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let mut stats = PoolStats {
            total: inner.slots.len(),
            max_concurrent: self.config.max_concurrent,
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for slot in &inner.slots {
            if slot.allocated {
                stats.busy += 1;
            }
            match slot.target.status {
                TargetStatus::Available if !slot.allocated => stats.available += 1,
                TargetStatus::Unhealthy => stats.unhealthy += 1,
                TargetStatus::Offline => stats.offline += 1,
                _ => {}
            }
        }
        stats
    }
}

/// 设备租约：持有并发许可与设备 id；drop 时若未显式归还则自动归还
pub struct TargetLease {
    pool: Arc<TargetPool>,
    target_id: String,
    platform: String,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl TargetLease {
    pub fn id(&self) -> &str {
        &self.target_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// 当前设备快照（含计数器）
    pub fn snapshot(&self) -> ExecutionTarget {
        self.pool.target(&self.target_id).unwrap_or_else(|| {
            let mut t = ExecutionTarget::new(self.target_id.clone(), self.platform.clone());
            t.status = TargetStatus::Busy;
            t
        })
    }

    pub fn record_success(&self, latency: Duration) {
        self.pool.record_success(&self.target_id, latency);
    }

    pub fn record_failure(&self) {
        self.pool.record_failure(&self.target_id);
    }

    fn release_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release_inner(&self.target_id);
        self.permit.take();
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(target_id = %self.target_id, "Lease dropped, releasing target");
            self.release_now();
        }
    }
}

impl std::fmt::Debug for TargetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetLease")
            .field("target_id", &self.target_id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize, max_concurrent: usize) -> Arc<TargetPool> {
        let pool = Arc::new(TargetPool::new(PoolConfig {
            max_concurrent,
            acquire_timeout: Duration::from_millis(100),
            unhealthy_threshold: 3,
        }));
        for i in 0..n {
            pool.register(ExecutionTarget::new(format!("emu-{i}"), "android"))
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_round_robin_spreads_load() {
        let pool = pool_with(3, 3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let lease = pool.acquire(None, Duration::from_millis(10)).await.unwrap();
            seen.push(lease.id().to_string());
            pool.release(lease);
        }
        assert_eq!(seen, vec!["emu-0", "emu-1", "emu-2", "emu-0", "emu-1", "emu-2"]);
    }

    #[tokio::test]
    async fn test_preferred_target_when_available() {
        let pool = pool_with(3, 3);
        let lease = pool.acquire(Some("emu-2"), Duration::from_millis(10)).await.unwrap();
        assert_eq!(lease.id(), "emu-2");

        // 首选设备被占用时退回轮询
        let other = pool.acquire(Some("emu-2"), Duration::from_millis(10)).await.unwrap();
        assert_ne!(other.id(), "emu-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_with_none() {
        let pool = pool_with(1, 2);
        let _held = pool.acquire(None, Duration::from_millis(10)).await.unwrap();
        assert!(pool.acquire(None, Duration::from_millis(50)).await.is_none());

        let empty = Arc::new(TargetPool::new(PoolConfig::default()));
        assert!(empty.acquire(None, Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_release() {
        let pool = pool_with(1, 1);
        let lease = pool.acquire(None, Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire(None, Duration::from_secs(5)).await;
                lease.map(|l| l.id().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.release(lease);

        assert_eq!(waiter.await.unwrap().as_deref(), Some("emu-0"));
    }

    #[tokio::test]
    async fn test_drop_releases_exactly_once() {
        let pool = pool_with(2, 2);
        {
            let _lease = pool.acquire(None, Duration::from_millis(10)).await.unwrap();
            assert_eq!(pool.busy_count(), 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.acquired_total, 1);
        assert_eq!(stats.released_total, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_target_returns_to_free_set_but_is_skipped() {
        let pool = pool_with(2, 2);
        let lease = pool.acquire(Some("emu-0"), Duration::from_millis(10)).await.unwrap();
        for _ in 0..3 {
            lease.record_failure();
        }
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Unhealthy);
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.unhealthy, 1);

        let next = pool.acquire(Some("emu-0"), Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.id(), "emu-1");
        pool.release(next);

        assert!(pool.set_status("emu-0", TargetStatus::Available));
        let back = pool.acquire(Some("emu-0"), Duration::from_millis(10)).await.unwrap();
        assert_eq!(back.id(), "emu-0");
    }

    #[tokio::test]
    async fn test_latency_average_and_counters() {
        let pool = pool_with(1, 1);
        pool.record_success("emu-0", Duration::from_millis(100));
        pool.record_success("emu-0", Duration::from_millis(200));
        pool.record_failure("emu-0");
        let t = pool.target("emu-0").unwrap();
        assert_eq!(t.success_count, 2);
        assert_eq!(t.error_count, 1);
        assert_eq!(t.consecutive_errors, 1);
        assert!((t.avg_latency_ms - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let pool = TargetPool::new(PoolConfig::default());
        pool.register(ExecutionTarget::new("emu-0", "android")).unwrap();
        let err = pool
            .register(ExecutionTarget::new("emu-0", "android"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_concurrency_limit_below_target_count() {
        let pool = pool_with(4, 2);
        let a = pool.acquire(None, Duration::from_millis(10)).await.unwrap();
        let b = pool.acquire(None, Duration::from_millis(10)).await.unwrap();
        assert!(pool.acquire(None, Duration::from_millis(10)).await.is_none());
        assert_eq!(pool.busy_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmit_is_half_open() {
        let pool = pool_with(1, 1);
        assert!(!pool.readmit("emu-0"));
        for _ in 0..3 {
            pool.record_failure("emu-0");
        }
        assert!(pool.unhealthy_targets(Duration::from_secs(1)).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.unhealthy_targets(Duration::from_secs(1)).len(), 1);

        assert!(pool.readmit("emu-0"));
        assert!(!pool.readmit("emu-0"));
        let target = pool.target("emu-0").unwrap();
        assert_eq!(target.status, TargetStatus::Available);
        assert_eq!(target.consecutive_errors, 2);

        pool.record_failure("emu-0");
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Unhealthy);
        assert!(!pool.readmit("missing"));
    }
}
