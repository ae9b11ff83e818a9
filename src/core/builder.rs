//! 运行时构建器：从 AppConfig 统一装配调度核心
//!
//! 设备池、熔断注册表、重试调度器、审计日志、死信恢复、编排器与任务分发器在这里构造一次，
//! 之后以 Arc 共享；协作方（感知 / 规划 / 动作 / 设备健康检查）由调用方注入。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{ActionExecutor, Collaborators, HealthCheck};
use crate::config::AppConfig;
use crate::core::audit::AuditLog;
use crate::core::circuit_breaker::BreakerRegistry;
use crate::core::error::CODE_NO_TARGET;
use crate::core::health::{CoolDownCheck, HealthMonitor};
use crate::core::orchestrator::Orchestrator;
use crate::core::pool::{ExecutionTarget, TargetPool};
use crate::core::recovery::{FailedOperation, RecoveryManager, RetryFn};
use crate::core::session_supervisor::TaskSupervisor;
use crate::core::shutdown::{
    BackgroundTaskCleanup, DispatcherCleanup, ShutdownCoordinator, ShutdownManager,
};
use crate::core::state::Action;
use crate::core::task_scheduler::RetryingScheduler;
use crate::core::TaskError;
use crate::dispatch::Dispatcher;
use crate::observability::{ErrorTracker, EventBus};

/// 死信重放时等待原设备的时间
const REPLAY_ACQUIRE_WAIT: Duration = Duration::from_secs(5);

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    collaborators: Collaborators,
    targets: Option<Vec<ExecutionTarget>>,
    audit_dir: Option<PathBuf>,
    cancel_root: Option<CancellationToken>,
    health_check: Option<Arc<dyn HealthCheck>>,
    event_capacity: usize,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            targets: None,
            audit_dir: None,
            cancel_root: None,
            health_check: None,
            event_capacity: 256,
        }
    }

    /// 覆盖配置文件里的设备列表
    pub fn with_targets(mut self, targets: Vec<ExecutionTarget>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    /// 任务取消令牌挂在该 token 之下（通常是关闭管理器的 token）
    pub fn with_cancel_root(mut self, token: CancellationToken) -> Self {
        self.cancel_root = Some(token);
        self
    }

    /// 设备健康检查；不设置时冷却期满即重新接纳
    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// 构建运行时；设备 id 重复时返回 validation 错误
    pub fn build(self) -> Result<Runtime, TaskError> {
        let config = self.config;

        let pool_config = config.pool.to_pool_config();
        let acquire_timeout = pool_config.acquire_timeout;
        let pool = Arc::new(TargetPool::new(pool_config));
        let targets = self.targets.unwrap_or_else(|| config.pool.to_targets());
        for target in targets {
            pool.register(target)?;
        }

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));
        let audit_dir = self.audit_dir.unwrap_or_else(|| config.app.audit_dir.clone());
        let audit = Arc::new(AuditLog::new(audit_dir, config.recovery.fsync));
        let scheduler = Arc::new(
            RetryingScheduler::new(config.scheduler.to_retry_policy(), Arc::clone(&breakers))
                .with_audit(Arc::clone(&audit)),
        );
        let recovery = Arc::new(RecoveryManager::new(
            config.recovery.to_recovery_config(),
            Arc::clone(&audit),
        ));

        let events = EventBus::new(self.event_capacity);
        let tracker = Arc::new(ErrorTracker::default());
        let orchestrator_config = config.orchestrator.to_orchestrator_config(acquire_timeout);
        let action_timeout = orchestrator_config.action_timeout;
        let executor = Arc::clone(&self.collaborators.executor);
        let orchestrator = Arc::new(
            Orchestrator::new(
                orchestrator_config,
                Arc::clone(&pool),
                Arc::clone(&scheduler),
                Arc::clone(&recovery),
                self.collaborators,
            )
            .with_events(events.clone())
            .with_tracker(Arc::clone(&tracker)),
        );

        let supervisor = Arc::new(match self.cancel_root {
            Some(token) => TaskSupervisor::with_root(token.child_token()),
            None => TaskSupervisor::new(),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&orchestrator),
            Arc::clone(&supervisor),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            self.health_check.unwrap_or_else(|| Arc::new(CoolDownCheck)),
            config.health.to_health_config(),
        ));

        let replay = replay_fn(
            Arc::clone(&pool),
            Arc::clone(&breakers),
            Arc::clone(&recovery),
            executor,
            action_timeout,
        );

        tracing::info!(
            app = %config.app.name,
            targets = pool.targets().len(),
            audit_dir = %audit.dir().display(),
            "Dispatch runtime ready"
        );

        Ok(Runtime {
            config,
            pool,
            breakers,
            scheduler,
            audit,
            recovery,
            orchestrator,
            supervisor,
            dispatcher,
            events,
            tracker,
            health,
            replay,
            background: CancellationToken::new(),
            sweeper: None,
            health_task: None,
        })
    }
}

/// 死信重放：在原设备上经熔断器重新执行失败的动作
///
/// 等设备期间死信可能已被所属任务 resolve，此时不再执行过期的动作。
fn replay_fn(
    pool: Arc<TargetPool>,
    breakers: Arc<BreakerRegistry>,
    recovery: Arc<RecoveryManager>,
    executor: Arc<ActionExecutor>,
    action_timeout: Duration,
) -> RetryFn {
    Arc::new(move |op: FailedOperation| {
        let pool = Arc::clone(&pool);
        let breakers = Arc::clone(&breakers);
        let recovery = Arc::clone(&recovery);
        let executor = Arc::clone(&executor);
        async move {
            let action = replay_action(&op)?;
            let target_id = op
                .context
                .get("target_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| TaskError::validation("dead letter has no target to replay on"))?;

            let lease = pool
                .acquire(Some(&target_id), REPLAY_ACQUIRE_WAIT)
                .await
                .ok_or_else(|| {
                    let message = format!("target {} unavailable for replay", target_id);
                    TaskError::infrastructure(message).with_code(CODE_NO_TARGET)
                })?;
            if lease.id() != target_id {
                pool.release(lease);
                return Err(TaskError::infrastructure(format!(
                    "target {} busy, replay deferred",
                    target_id
                ))
                .with_code(CODE_NO_TARGET));
            }
            if recovery.get(&op.operation_id).is_some_and(|o| o.resolved) {
                pool.release(lease);
                tracing::debug!(
                    operation_id = %op.operation_id,
                    "Dead letter already resolved, replay skipped"
                );
                return Ok(());
            }

            let target = lease.snapshot();
            let breaker = breakers.get(&format!("device:{}", target_id));
            let started = Instant::now();
            let result = breaker
                .call(|| async {
                    let perform = executor.perform(&action, &target);
                    match tokio::time::timeout(action_timeout, perform).await {
                        Ok(r) => r,
                        Err(_) => Err(TaskError::timeout(&action.kind, action_timeout)),
                    }
                })
                .await;
            match &result {
                Ok(()) => lease.record_success(started.elapsed()),
                Err(e) if !e.is_breaker_open() && !e.is_fatal() => lease.record_failure(),
                Err(_) => {}
            }
            pool.release(lease);
            result
        }
        .boxed()
    })
}

fn replay_action(op: &FailedOperation) -> Result<Action, TaskError> {
    let value = op
        .context
        .get("action")
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| {
            TaskError::validation(format!("{} has no device action to replay", op.operation_name))
        })?;
    serde_json::from_value(value)
        .map_err(|e| TaskError::validation(format!("malformed action in dead letter: {}", e)))
}

/// 装配好的运行时
pub struct Runtime {
    pub config: AppConfig,
    pub pool: Arc<TargetPool>,
    pub breakers: Arc<BreakerRegistry>,
    pub scheduler: Arc<RetryingScheduler>,
    pub audit: Arc<AuditLog>,
    pub recovery: Arc<RecoveryManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub supervisor: Arc<TaskSupervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: EventBus,
    pub tracker: Arc<ErrorTracker>,
    pub health: Arc<HealthMonitor>,
    replay: RetryFn,
    /// 后台循环（sweep、健康监控）共用的停止 token
    background: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl Runtime {
    /// 死信重放回调（sweep 使用，也可手动调用 attempt_retry）
    pub fn replay_fn(&self) -> &RetryFn {
        &self.replay
    }

    /// 启动后台 sweep；重复调用无副作用
    pub fn start_sweeper(&mut self) -> bool {
        if self.sweeper.is_some() {
            return true;
        }
        self.sweeper = self
            .recovery
            .spawn_sweeper(Arc::clone(&self.replay), self.background.clone());
        self.sweeper.is_some()
    }

    /// 启动设备健康监控；[health] enabled = false 时不启动
    pub fn start_health_monitor(&mut self) -> bool {
        if self.health_task.is_some() {
            return true;
        }
        if !self.config.health.enabled {
            tracing::info!("Target health monitor disabled");
            return false;
        }
        self.health_task = Some(self.health.spawn(self.background.clone()));
        true
    }

    /// 启动所有后台循环
    pub fn start_background(&mut self) {
        self.start_sweeper();
        self.start_health_monitor();
    }

    /// 立即执行一轮死信重放，返回恢复条数
    pub async fn sweep_now(&self) -> usize {
        self.recovery.sweep_once(&self.replay).await
    }

    /// 取消在跑任务、停止后台循环，并在超时内等待清理完成
    pub async fn shutdown(mut self, manager: Arc<ShutdownManager>, timeout_secs: u64) {
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(timeout_secs);
        coordinator.register(DispatcherCleanup::new(Arc::clone(&self.dispatcher)));
        coordinator.register(BackgroundTaskCleanup::new(
            "RecoverySweeper",
            self.background.clone(),
            self.sweeper.take(),
        ));
        coordinator.register(BackgroundTaskCleanup::new(
            "HealthMonitor",
            self.background.clone(),
            self.health_task.take(),
        ));
        coordinator.run_cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::mock::{
        login_plan, ScriptedHandler, ScriptedPerception, ScriptedPlanner,
    };
    use crate::capabilities::ActionRegistry;
    use crate::core::recovery::RecoveryStrategy;
    use serde_json::json;

    fn collaborators(handler: Arc<ScriptedHandler>) -> Collaborators {
        let mut registry = ActionRegistry::new();
        registry.register_arc(handler);
        Collaborators::new(
            Arc::new(ScriptedPerception::login_screen()),
            Arc::new(ScriptedPlanner::new(login_plan())),
            Arc::new(ActionExecutor::new(registry)),
        )
    }

    #[tokio::test]
    async fn test_build_rejects_duplicate_targets() {
        let dir = tempfile::tempdir().unwrap();
        let result = RuntimeBuilder::new(
            AppConfig::default(),
            collaborators(Arc::new(ScriptedHandler::new("tap"))),
        )
        .with_audit_dir(dir.path())
        .with_targets(vec![
            ExecutionTarget::new("emu-0", "android"),
            ExecutionTarget::new("emu-0", "android"),
        ])
        .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_replay_performs_action_on_original_target() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(ScriptedHandler::new("tap"));
        let runtime = RuntimeBuilder::new(AppConfig::default(), collaborators(handler.clone()))
            .with_audit_dir(dir.path())
            .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
            .build()
            .unwrap();

        let id = runtime.recovery.record(
            "tap",
            TaskError::element("button hidden"),
            json!({
                "task_id": "t-1",
                "target_id": "emu-0",
                "action": {"kind": "tap", "params": {"element": "login_button"}},
            }),
            Some(RecoveryStrategy::Retry),
            None,
        );

        assert!(runtime.recovery.attempt_retry(&id, runtime.replay_fn()).await);
        assert_eq!(handler.calls_for("login_button"), 1);
        assert!(runtime.recovery.get(&id).unwrap().resolved);
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_skips_dead_letter_resolved_while_waiting_for_target() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(ScriptedHandler::new("tap"));
        let runtime = RuntimeBuilder::new(AppConfig::default(), collaborators(handler.clone()))
            .with_audit_dir(dir.path())
            .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
            .build()
            .unwrap();
        let id = runtime.recovery.record(
            "tap",
            TaskError::element("button hidden"),
            json!({
                "task_id": "t-1",
                "target_id": "emu-0",
                "action": {"kind": "tap", "params": {"element": "login_button"}},
            }),
            Some(RecoveryStrategy::Retry),
            None,
        );

        // 任务仍占着设备，重放只能等待
        let lease = runtime
            .pool
            .acquire(Some("emu-0"), Duration::from_secs(1))
            .await
            .unwrap();
        let replay = {
            let recovery = Arc::clone(&runtime.recovery);
            let retry = Arc::clone(runtime.replay_fn());
            let id = id.clone();
            tokio::spawn(async move { recovery.attempt_retry(&id, &retry).await })
        };
        tokio::task::yield_now().await;

        assert!(runtime.recovery.resolve(&id));
        runtime.pool.release(lease);

        assert!(!replay.await.unwrap());
        assert_eq!(handler.calls_for("login_button"), 0);
        let op = runtime.recovery.get(&id).unwrap();
        assert!(op.resolved);
        assert_eq!(op.retry_count, 0);
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_without_action_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeBuilder::new(
            AppConfig::default(),
            collaborators(Arc::new(ScriptedHandler::new("tap"))),
        )
        .with_audit_dir(dir.path())
        .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
        .build()
        .unwrap();

        let id = runtime.recovery.record(
            "perception",
            TaskError::external("perception", "model overloaded"),
            json!({"task_id": "t-1", "target_id": "emu-0", "action": null}),
            Some(RecoveryStrategy::Retry),
            None,
        );
        assert!(!runtime.recovery.attempt_retry(&id, runtime.replay_fn()).await);
        assert_eq!(runtime.recovery.get(&id).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_readmits_unhealthy_target_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.recovery.fsync = false;
        config.pool.unhealthy_threshold = 1;
        config.health.interval_secs = 10;
        config.health.cool_down_secs = 10;
        let tap = Arc::new(ScriptedHandler::new("tap"));
        let mut runtime = RuntimeBuilder::new(config, collaborators(tap))
            .with_audit_dir(dir.path())
            .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
            .build()
            .unwrap();

        runtime.pool.record_failure("emu-0");
        assert!(runtime.pool.acquire(None, Duration::from_secs(1)).await.is_none());

        assert!(runtime.start_health_monitor());
        let lease = runtime.pool.acquire(None, Duration::from_secs(60)).await;
        assert_eq!(lease.as_ref().map(|l| l.id()), Some("emu-0"));
        drop(lease);

        let manager = Arc::new(ShutdownManager::new());
        runtime.shutdown(Arc::clone(&manager), 1).await;
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_health_monitor_respects_disabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.health.enabled = false;
        let tap = Arc::new(ScriptedHandler::new("tap"));
        let mut runtime = RuntimeBuilder::new(config, collaborators(tap))
            .with_audit_dir(dir.path())
            .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
            .build()
            .unwrap();
        assert!(!runtime.start_health_monitor());
    }
}
