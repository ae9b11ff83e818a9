//! 设备健康监控：定期检查 unhealthy 设备并重新接纳
//!
//! 设备被标记为 unhealthy 至少 cool_down 之后才会被检查；检查通过则以 half-open 方式放回池中
//! （见 `TargetPool::readmit`），失败或超时则保持 unhealthy，等下一轮。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capabilities::HealthCheck;
use crate::core::pool::{ExecutionTarget, TargetPool};
use crate::core::TaskError;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// 两轮检查之间的间隔
    pub interval: Duration,
    /// 单次检查超时
    pub check_timeout: Duration,
    /// 标记为 unhealthy 后至少等待多久才检查
    pub cool_down: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            cool_down: Duration::from_secs(30),
        }
    }
}

/// 没有注入真实检查时使用：冷却期满即视为健康
pub struct CoolDownCheck;

#[async_trait]
impl HealthCheck for CoolDownCheck {
    async fn check(&self, _target: &ExecutionTarget) -> Result<(), TaskError> {
        Ok(())
    }
}

/// 一轮检查的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthRound {
    pub checked: usize,
    pub readmitted: Vec<String>,
    pub still_unhealthy: Vec<String>,
}

pub struct HealthMonitor {
    pool: Arc<TargetPool>,
    checker: Arc<dyn HealthCheck>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<TargetPool>,
        checker: Arc<dyn HealthCheck>,
        config: HealthConfig,
    ) -> Self {
        Self {
            pool,
            checker,
            config,
        }
    }

    /// 检查所有冷却期满的 unhealthy 设备
    pub async fn check_once(&self) -> HealthRound {
        let mut round = HealthRound::default();
        for target in self.pool.unhealthy_targets(self.config.cool_down) {
            round.checked += 1;
            let check = self.checker.check(&target);
            let outcome = tokio::time::timeout(self.config.check_timeout, check).await;
            match outcome {
                Ok(Ok(())) => {
                    if self.pool.readmit(&target.id) {
                        round.readmitted.push(target.id);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(target_id = %target.id, error = %e, "Health check failed");
                    round.still_unhealthy.push(target.id);
                }
                Err(_) => {
                    tracing::warn!(
                        target_id = %target.id,
                        timeout_ms = self.config.check_timeout.as_millis() as u64,
                        "Health check timed out"
                    );
                    round.still_unhealthy.push(target.id);
                }
            }
        }
        if round.checked > 0 {
            tracing::debug!(
                checked = round.checked,
                readmitted = round.readmitted.len(),
                "Health check round finished"
            );
        }
        round
    }

    /// 后台循环，直到 cancel 被触发
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = self.config.interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        monitor.check_once().await;
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::{PoolConfig, TargetStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(threshold: u32) -> Arc<TargetPool> {
        let pool = Arc::new(TargetPool::new(PoolConfig {
            max_concurrent: 2,
            acquire_timeout: Duration::from_secs(1),
            unhealthy_threshold: threshold,
        }));
        pool.register(ExecutionTarget::new("emu-0", "android")).unwrap();
        pool.register(ExecutionTarget::new("emu-1", "android")).unwrap();
        pool
    }

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(1),
            cool_down: Duration::from_secs(10),
        }
    }

    struct FlakyCheck {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl HealthCheck for FlakyCheck {
        async fn check(&self, _target: &ExecutionTarget) -> Result<(), TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(TaskError::infrastructure("adb offline"));
            }
            Ok(())
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl HealthCheck for HangingCheck {
        async fn check(&self, _target: &ExecutionTarget) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmits_after_cool_down() {
        let pool = pool(2);
        pool.record_failure("emu-0");
        pool.record_failure("emu-0");
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Unhealthy);

        let monitor = HealthMonitor::new(Arc::clone(&pool), Arc::new(CoolDownCheck), config());
        // 冷却期内不检查
        let round = monitor.check_once().await;
        assert_eq!(round.checked, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        let round = monitor.check_once().await;
        assert_eq!(round.readmitted, vec!["emu-0".to_string()]);
        let target = pool.target("emu-0").unwrap();
        assert_eq!(target.status, TargetStatus::Available);
        assert_eq!(target.consecutive_errors, 1);
        assert_eq!(pool.stats().unhealthy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmitted_target_trips_again_on_next_failure() {
        let pool = pool(3);
        for _ in 0..3 {
            pool.record_failure("emu-1");
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let monitor = HealthMonitor::new(Arc::clone(&pool), Arc::new(CoolDownCheck), config());
        monitor.check_once().await;
        assert_eq!(pool.target("emu-1").unwrap().status, TargetStatus::Available);

        pool.record_failure("emu-1");
        assert_eq!(pool.target("emu-1").unwrap().status, TargetStatus::Unhealthy);

        // 重新计时：刚刚再次失败，本轮不检查
        let round = monitor.check_once().await;
        assert_eq!(round.checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_check_keeps_target_unhealthy() {
        let pool = pool(1);
        pool.record_failure("emu-0");
        tokio::time::advance(Duration::from_secs(11)).await;

        let checker = Arc::new(FlakyCheck {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let monitor = HealthMonitor::new(Arc::clone(&pool), checker.clone(), config());

        let round = monitor.check_once().await;
        assert_eq!(round.still_unhealthy, vec!["emu-0".to_string()]);
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Unhealthy);

        let round = monitor.check_once().await;
        assert_eq!(round.readmitted, vec!["emu-0".to_string()]);
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_check_times_out() {
        let pool = pool(1);
        pool.record_failure("emu-0");
        tokio::time::advance(Duration::from_secs(11)).await;

        let monitor = HealthMonitor::new(Arc::clone(&pool), Arc::new(HangingCheck), config());
        let round = monitor.check_once().await;
        assert_eq!(round.checked, 1);
        assert!(round.readmitted.is_empty());
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_and_allocated_targets_are_not_checked() {
        let pool = pool(1);
        pool.set_status("emu-0", TargetStatus::Offline);
        let lease = pool.acquire(Some("emu-1"), Duration::from_millis(10)).await.unwrap();
        pool.record_failure("emu-1");
        tokio::time::advance(Duration::from_secs(11)).await;

        let monitor = HealthMonitor::new(Arc::clone(&pool), Arc::new(CoolDownCheck), config());
        assert_eq!(monitor.check_once().await.checked, 0);

        pool.release(lease);
        assert_eq!(monitor.check_once().await.readmitted, vec!["emu-1".to_string()]);
        assert_eq!(pool.target("emu-0").unwrap().status, TargetStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_wakes_waiting_acquire() {
        let pool = pool(1);
        pool.set_status("emu-1", TargetStatus::Offline);
        pool.record_failure("emu-0");

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            Arc::new(CoolDownCheck),
            config(),
        ));
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(cancel.clone());

        let lease = pool.acquire(None, Duration::from_secs(30)).await;
        assert_eq!(lease.as_ref().map(|l| l.id()), Some("emu-0"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
