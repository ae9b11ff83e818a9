//! 调度集成测试：瞬时失败重试、死信 + 纠正计划、阶段切换上限、超时 / 取消归还设备、设备池守恒

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use autorl::capabilities::mock::{
        login_plan, ScriptedHandler, ScriptedPerception, ScriptedPlanner,
    };
    use autorl::capabilities::{ActionExecutor, ActionRegistry, Collaborators};
    use autorl::config::AppConfig;
    use autorl::core::audit::{AuditEvent, AuditRecord};
    use autorl::core::error::{CODE_CANCELLED, CODE_HANDOFF_BUDGET, CODE_TASK_TIMEOUT};
    use autorl::core::pool::{ExecutionTarget, PoolConfig, TargetPool, TargetStatus};
    use autorl::core::recovery::RecoveryStrategy;
    use autorl::core::state::{Action, Stage};
    use autorl::{Runtime, RuntimeBuilder, TaskError, TaskRequest};
    use serde_json::json;

    fn tap(element: &str) -> Action {
        Action::new("tap", json!({ "element": element }))
    }

    fn type_text_action(element: &str, text: &str) -> Action {
        Action::new("type_text", json!({ "element": element, "text": text }))
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.recovery.fsync = false;
        config.recovery.auto_retry = false;
        config.scheduler.max_retries = 3;
        config
    }

    fn build(
        dir: &std::path::Path,
        config: AppConfig,
        handlers: Vec<Arc<ScriptedHandler>>,
        planner: ScriptedPlanner,
    ) -> Runtime {
        let mut registry = ActionRegistry::new();
        for handler in handlers {
            registry.register_arc(handler);
        }
        let collaborators = Collaborators::new(
            Arc::new(ScriptedPerception::login_screen()),
            Arc::new(planner),
            Arc::new(ActionExecutor::new(registry)),
        );
        RuntimeBuilder::new(config, collaborators)
            .with_audit_dir(dir)
            .with_targets(vec![ExecutionTarget::new("emu-0", "android")])
            .build()
            .unwrap()
    }

    fn count(records: &[AuditRecord], event: AuditEvent) -> usize {
        records.iter().filter(|r| r.event == event).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_without_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let type_text = Arc::new(ScriptedHandler::new("type_text").fail_times(
            "password_field",
            2,
            TaskError::element("keyboard not shown"),
        ));
        let runtime = build(
            dir.path(),
            test_config(),
            vec![type_text.clone(), Arc::new(ScriptedHandler::new("tap"))],
            ScriptedPlanner::new(login_plan()),
        );

        let id = runtime.dispatcher.submit(TaskRequest::new("log in")).await.unwrap();
        let report = runtime.dispatcher.wait(&id).await.unwrap();

        assert_eq!(report.stage, Stage::Completed);
        assert_eq!(report.completed_actions, 3);
        assert!(!report.recovery_attempted);
        assert!(report.dead_letters.is_empty());
        assert_eq!(type_text.calls_for("password_field"), 3);

        let records = runtime.audit.read_records().unwrap();
        assert_eq!(count(&records, AuditEvent::AttemptFailed), 2);
        assert_eq!(count(&records, AuditEvent::Resolved), 2);
        assert_eq!(count(&records, AuditEvent::DeadLetter), 0);

        assert_eq!(runtime.pool.busy_count(), 0);
        let stats = runtime.pool.stats();
        assert_eq!(stats.acquired_total, stats.released_total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_dead_letter_then_corrective_plan_completes() {
        let dir = tempfile::tempdir().unwrap();
        let type_text = Arc::new(ScriptedHandler::new("type_text").fail_times(
            "password_field",
            4,
            TaskError::element("password field not focusable"),
        ));
        let tap_handler = Arc::new(ScriptedHandler::new("tap"));
        let runtime = build(
            dir.path(),
            test_config(),
            vec![type_text.clone(), tap_handler.clone()],
            ScriptedPlanner::new(login_plan()).always_correct_with(vec![
                type_text_action("password_field", "secret"),
                tap("login_button"),
            ]),
        );

        let id = runtime.dispatcher.submit(TaskRequest::new("log in")).await.unwrap();
        let report = runtime.dispatcher.wait(&id).await.unwrap();

        assert_eq!(report.stage, Stage::Completed);
        assert!(report.recovery_attempted);
        assert_eq!(report.recovery_attempts, 1);
        assert_eq!(report.dead_letters.len(), 1);
        let outcome = report.recovery_outcome.clone().unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::Retry);
        assert!(outcome.recovered);
        assert_eq!(type_text.calls_for("password_field"), 5);
        // 登录按钮只在纠正计划里被点了一次
        assert_eq!(tap_handler.calls_for("login_button"), 1);

        let records = runtime.audit.read_records().unwrap();
        let dead: Vec<_> = records
            .iter()
            .filter(|r| r.event == AuditEvent::DeadLetter)
            .collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].strategy, Some(RecoveryStrategy::Retry));
        assert_eq!(count(&records, AuditEvent::AttemptFailed), 4);

        let op = runtime.recovery.get(&report.dead_letters[0]).unwrap();
        assert!(op.resolved);
        assert_eq!(op.context["action"]["params"]["element"], "password_field");
        assert!(runtime.audit.unresolved_dead_letters().unwrap().is_empty());
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_target_is_readmitted_for_next_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.pool.unhealthy_threshold = 3;
        config.orchestrator.max_recovery_attempts = 0;
        config.health.interval_secs = 5;
        config.health.cool_down_secs = 5;
        let tap_handler = Arc::new(ScriptedHandler::new("tap").fail_times(
            "login_button",
            4,
            TaskError::element("login button not clickable"),
        ));
        let mut runtime = build(
            dir.path(),
            config,
            vec![tap_handler.clone(), Arc::new(ScriptedHandler::new("type_text"))],
            ScriptedPlanner::new(login_plan()),
        );
        assert!(runtime.start_health_monitor());

        let first = runtime.dispatcher.submit(TaskRequest::new("log in")).await.unwrap();
        let failed = runtime.dispatcher.wait(&first).await.unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(
            runtime.pool.target("emu-0").unwrap().status,
            TargetStatus::Unhealthy
        );

        let second = runtime.dispatcher.submit(TaskRequest::new("log in")).await.unwrap();
        let report = runtime.dispatcher.wait(&second).await.unwrap();
        assert_eq!(report.stage, Stage::Completed);
        assert_eq!(report.target_id.as_deref(), Some("emu-0"));
        assert_eq!(tap_handler.calls_for("login_button"), 5);

        let target = runtime.pool.target("emu-0").unwrap();
        assert_eq!(target.status, TargetStatus::Available);
        assert_eq!(target.consecutive_errors, 0);
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_budget_terminates_endless_correction_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.scheduler.max_retries = 0;
        config.orchestrator.max_handoffs = 6;
        config.orchestrator.max_recovery_attempts = 10;
        let tap_handler = Arc::new(
            ScriptedHandler::new("tap")
                .always_fail("ghost_button", TaskError::element("not found")),
        );
        let runtime = build(
            dir.path(),
            config,
            vec![tap_handler],
            ScriptedPlanner::new(vec![tap("ghost_button")])
                .always_correct_with(vec![tap("ghost_button")]),
        );

        let id = runtime.dispatcher.submit(TaskRequest::new("tap ghost")).await.unwrap();
        let report = runtime.dispatcher.wait(&id).await.unwrap();

        assert_eq!(report.stage, Stage::Failed);
        assert_eq!(report.error.unwrap().code, CODE_HANDOFF_BUDGET);
        assert!(report.handoffs <= 6);
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_releases_target() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(
            dir.path(),
            test_config(),
            vec![
                Arc::new(ScriptedHandler::new("tap").with_delay(Duration::from_secs(40))),
                Arc::new(ScriptedHandler::new("type_text")),
            ],
            ScriptedPlanner::new(login_plan()),
        );

        let request = TaskRequest::new("log in").with_timeout(Duration::from_secs(5));
        let id = runtime.dispatcher.submit(request).await.unwrap();
        let report = runtime.dispatcher.wait(&id).await.unwrap();

        assert_eq!(report.stage, Stage::Failed);
        assert_eq!(report.error.unwrap().code, CODE_TASK_TIMEOUT);
        assert_eq!(runtime.pool.busy_count(), 0);

        // 设备归还后下一个任务可以拿到它
        let next = runtime.pool.acquire(None, Duration::from_millis(10)).await;
        assert!(next.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_target_for_waiting_task() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(
            dir.path(),
            test_config(),
            vec![
                Arc::new(ScriptedHandler::new("tap").with_delay(Duration::from_secs(40))),
                Arc::new(ScriptedHandler::new("type_text")),
            ],
            ScriptedPlanner::new(login_plan()),
        );
        let dispatcher = &runtime.dispatcher;

        let first = dispatcher.submit(TaskRequest::new("log in")).await.unwrap();
        let second = dispatcher.submit(TaskRequest::new("log in again")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(dispatcher.cancel(&first).await);

        let cancelled = dispatcher.wait(&first).await.unwrap();
        assert_eq!(cancelled.error.unwrap().code, CODE_CANCELLED);

        let completed = dispatcher.wait(&second).await.unwrap();
        assert_eq!(completed.stage, Stage::Completed);
        assert_eq!(completed.target_id.as_deref(), Some("emu-0"));
        assert_eq!(runtime.pool.busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_conservation_under_contention() {
        let pool = Arc::new(TargetPool::new(PoolConfig {
            max_concurrent: 2,
            acquire_timeout: Duration::from_secs(1),
            unhealthy_threshold: 3,
        }));
        for i in 0..3 {
            pool.register(ExecutionTarget::new(format!("emu-{}", i), "android"))
                .unwrap();
        }
        let max_busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..24u64).map(|i| {
            let pool = Arc::clone(&pool);
            let max_busy = Arc::clone(&max_busy);
            async move {
                let wait = Duration::from_millis(50 + (i * 37) % 400);
                let Some(lease) = pool.acquire(None, wait).await else {
                    return false;
                };
                max_busy.fetch_max(pool.busy_count(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20 + (i * 53) % 120)).await;
                match i % 3 {
                    0 => pool.release(lease),
                    1 => drop(lease),
                    _ => {
                        // 持有中途被取消
                        let hold = tokio::time::sleep(Duration::from_secs(60));
                        let _ = tokio::time::timeout(Duration::from_millis(10), async move {
                            let _lease = lease;
                            hold.await;
                        })
                        .await;
                    }
                }
                true
            }
        });
        let results = futures_util::future::join_all(workers).await;

        assert!(results.iter().any(|acquired| *acquired));
        assert!(max_busy.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.busy_count(), 0);
        let stats = pool.stats();
        assert_eq!(stats.acquired_total, stats.released_total);
        assert_eq!(stats.available, 3);
    }
}
