//! 任务编排器：阶段切换状态机
//!
//! 每个任务一个逻辑流：从设备池拿设备，依次走 perception → planning → execution，
//! 失败时进入 recovery → reflection → execution；阶段切换总数受 max_handoffs 限制，耗尽即失败。
//! 取消与任务级超时打断整个流程，设备在任务进入终态之后归还（lease drop 也会归还）。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{ActionExecutor, Collaborators, Perception, Planner};
use crate::core::error::{CODE_EMPTY_PLAN, CODE_NO_TARGET};
use crate::core::pool::{TargetLease, TargetPool};
use crate::core::recovery::RecoveryManager;
use crate::core::state::{Action, Stage, TaskContext, TaskReport, TaskRequest, TaskSnapshot};
use crate::core::task_scheduler::{OperationSpec, RetryingScheduler};
use crate::core::TaskError;
use crate::observability::{DispatchEvent, ErrorTracker, EventBus};

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 单任务阶段切换上限
    pub max_handoffs: u32,
    /// 单任务恢复次数上限
    pub max_recovery_attempts: u32,
    pub acquire_timeout: Duration,
    pub perception_timeout: Duration,
    pub planning_timeout: Duration,
    pub action_timeout: Duration,
    /// 感知 / 规划调用的额外重试次数
    pub stage_max_retries: u32,
    /// 恢复时先执行的「回到安全界面」动作
    pub safe_state_action: Option<Action>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_handoffs: 15,
            max_recovery_attempts: 2,
            acquire_timeout: Duration::from_secs(30),
            perception_timeout: Duration::from_secs(30),
            planning_timeout: Duration::from_secs(60),
            action_timeout: Duration::from_secs(45),
            stage_max_retries: 1,
            safe_state_action: None,
        }
    }
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<TargetPool>,
    scheduler: Arc<RetryingScheduler>,
    recovery: Arc<RecoveryManager>,
    collaborators: Collaborators,
    events: EventBus,
    tracker: Arc<ErrorTracker>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        pool: Arc<TargetPool>,
        scheduler: Arc<RetryingScheduler>,
        recovery: Arc<RecoveryManager>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            pool,
            scheduler,
            recovery,
            collaborators,
            events: EventBus::default(),
            tracker: Arc::new(ErrorTracker::default()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<TargetPool> {
        &self.pool
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    /// 运行一个任务直到终态；progress 用于对外广播进度
    pub async fn run(
        &self,
        task_id: String,
        request: TaskRequest,
        cancel: CancellationToken,
        progress: Option<watch::Sender<TaskSnapshot>>,
    ) -> TaskReport {
        let started = Instant::now();
        let deadline = request.timeout.map(|t| started + t);
        let task_timeout = request.timeout.unwrap_or_default();
        let progress = progress.as_ref();
        let mut ctx = TaskContext::new(task_id, request.instruction.clone());
        tracing::info!(task_id = %ctx.task_id, instruction = %ctx.instruction, "Task started");
        self.enter(&ctx, progress);

        if request.instruction.trim().is_empty() {
            self.note_failure(&mut ctx, TaskError::validation("instruction must not be empty"));
            self.handoff(&mut ctx, Stage::Failed, progress);
            return self.finish(ctx, started, progress);
        }

        let hint = request.target_hint.as_deref();
        let acquired = tokio::select! {
            lease = self.pool.acquire(hint, self.config.acquire_timeout) => Ok(lease),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = deadline_elapsed(deadline) => Err(Interrupt::TimedOut(task_timeout)),
        };
        let lease = match acquired {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                let err = TaskError::infrastructure(format!(
                    "no execution target available within {}ms",
                    self.config.acquire_timeout.as_millis()
                ))
                .with_code(CODE_NO_TARGET);
                self.note_failure(&mut ctx, err);
                self.handoff(&mut ctx, Stage::Failed, progress);
                return self.finish(ctx, started, progress);
            }
            Err(interrupt) => {
                self.interrupt(&mut ctx, interrupt, progress);
                return self.finish(ctx, started, progress);
            }
        };
        ctx.target_id = Some(lease.id().to_string());

        let interrupted = {
            let walk = self.walk(&mut ctx, &lease, &request, progress);
            tokio::pin!(walk);
            tokio::select! {
                _ = &mut walk => None,
                _ = cancel.cancelled() => Some(Interrupt::Cancelled),
                _ = deadline_elapsed(deadline) => Some(Interrupt::TimedOut(task_timeout)),
            }
        };
        if let Some(interrupt) = interrupted {
            self.interrupt(&mut ctx, interrupt, progress);
        }

        let report = self.finish(ctx, started, progress);
        self.pool.release(lease);
        report
    }

    async fn walk(
        &self,
        ctx: &mut TaskContext,
        lease: &TargetLease,
        request: &TaskRequest,
        progress: Option<&watch::Sender<TaskSnapshot>>,
    ) {
        while !ctx.stage.is_terminal() {
            let next = match ctx.stage {
                Stage::Perception => self.perceive(ctx, lease).await,
                Stage::Planning => self.plan(ctx).await,
                Stage::Execution => self.execute(ctx, lease, request, progress).await,
                Stage::Recovery => self.recover(ctx, lease).await,
                Stage::Reflection => self.reflect(ctx).await,
                Stage::Completed | Stage::Failed => break,
            };
            self.handoff(ctx, next, progress);
        }
    }

    async fn perceive(&self, ctx: &mut TaskContext, lease: &TargetLease) -> Stage {
        let spec = OperationSpec::new("capture", "perception", self.scheduler.policy())
            .with_timeout(self.config.perception_timeout)
            .with_max_retries(self.config.stage_max_retries);
        let target = lease.snapshot();
        let target = &target;
        let perception: &dyn Perception = self.collaborators.perception.as_ref();

        let outcome = self
            .scheduler
            .schedule(&spec, None, move |_| perception.capture(target))
            .await;
        match outcome.result {
            Ok(ui) => {
                ctx.ui_state = Some(ui);
                Stage::Planning
            }
            Err(err) => self.route_failure(ctx, &spec.name, None, err),
        }
    }

    async fn plan(&self, ctx: &mut TaskContext) -> Stage {
        let Some(ui) = ctx.ui_state.clone() else {
            let err = TaskError::unknown("planning without a screen snapshot");
            return self.route_failure(ctx, "plan", None, err);
        };
        let spec = OperationSpec::new("plan", "planner", self.scheduler.policy())
            .with_timeout(self.config.planning_timeout)
            .with_max_retries(self.config.stage_max_retries);
        let instruction = ctx.instruction.clone();
        let (instruction, ui) = (instruction.as_str(), &ui);
        let planner: &dyn Planner = self.collaborators.planner.as_ref();

        let outcome = self
            .scheduler
            .schedule(&spec, None, move |_| planner.plan(instruction, ui))
            .await;
        match outcome.result {
            Ok(plan) if plan.is_empty() => {
                let err = TaskError::external("planner", "planner returned an empty plan")
                    .with_code(CODE_EMPTY_PLAN);
                self.fail_call(ctx, &spec.name, None, err);
                Stage::Reflection
            }
            Ok(plan) => {
                tracing::debug!(task_id = %ctx.task_id, steps = plan.len(), "Plan ready");
                ctx.plan = plan;
                ctx.cursor = 0;
                Stage::Execution
            }
            Err(err) => self.route_failure(ctx, &spec.name, None, err),
        }
    }

    async fn execute(
        &self,
        ctx: &mut TaskContext,
        lease: &TargetLease,
        request: &TaskRequest,
        progress: Option<&watch::Sender<TaskSnapshot>>,
    ) -> Stage {
        let policy = self.scheduler.policy();
        let max_retries = request.max_retries.unwrap_or(policy.max_retries);
        let dependency = format!("device:{}", lease.id());
        let executor: &ActionExecutor = self.collaborators.executor.as_ref();

        while ctx.cursor < ctx.plan.len() {
            let action = ctx.plan[ctx.cursor].clone();
            let spec = OperationSpec::new(action.kind.clone(), dependency.clone(), policy)
                .with_timeout(self.config.action_timeout)
                .with_max_retries(max_retries);
            let target = lease.snapshot();
            let (action_ref, target_ref) = (&action, &target);

            let outcome = self
                .scheduler
                .schedule(&spec, Some(lease), move |_| executor.perform(action_ref, target_ref))
                .await;
            match outcome.result {
                Ok(()) => {
                    ctx.cursor += 1;
                    ctx.completed_actions += 1;
                    self.events.emit(DispatchEvent::ActionProgress {
                        task_id: ctx.task_id.clone(),
                        action: action.kind.clone(),
                        index: ctx.cursor,
                        total: ctx.plan.len(),
                    });
                    if let Some(tx) = progress {
                        tx.send_replace(ctx.snapshot());
                    }
                }
                Err(err) => {
                    ctx.metadata.insert("failed_call_id".into(), json!(outcome.call_id));
                    ctx.metadata.insert("failed_attempts".into(), json!(outcome.attempts));
                    return self.route_failure(ctx, &spec.name, Some(action), err);
                }
            }
        }
        Stage::Completed
    }

    async fn recover(&self, ctx: &mut TaskContext, lease: &TargetLease) -> Stage {
        let Some(err) = ctx.last_error.clone() else {
            self.note_failure(ctx, TaskError::unknown("recovery entered without an error"));
            return Stage::Failed;
        };
        if err.is_fatal() {
            tracing::warn!(
                task_id = %ctx.task_id,
                code = %err.code,
                "Invalid input, recovery skipped"
            );
            return Stage::Failed;
        }
        if ctx.recovery_attempts >= self.config.max_recovery_attempts {
            tracing::warn!(
                task_id = %ctx.task_id,
                attempts = ctx.recovery_attempts,
                "Recovery attempts exhausted"
            );
            return Stage::Failed;
        }
        ctx.recovery_attempts += 1;
        ctx.metadata
            .insert("recovery_attempts".into(), json!(ctx.recovery_attempts));

        let name = ctx
            .failed_operation
            .clone()
            .unwrap_or_else(|| "task".to_string());
        let context = json!({
            "task_id": ctx.task_id,
            "instruction": ctx.instruction,
            "target_id": lease.id(),
            "action": ctx.failed_action,
            "call_id": ctx.metadata.get("failed_call_id"),
        });
        let outcome = self.recovery.recover(&name, err, context, None).await;
        ctx.dead_letters.push(outcome.operation_id.clone());
        let recovered = outcome.recovered;
        ctx.recovery_outcome = Some(outcome);
        if !recovered {
            return Stage::Failed;
        }

        if let Some(action) = self.config.safe_state_action.clone() {
            let spec = OperationSpec::new(
                format!("safe_state:{}", action.kind),
                format!("device:{}", lease.id()),
                self.scheduler.policy(),
            )
            .with_timeout(self.config.action_timeout)
            .with_max_retries(0);
            let target = lease.snapshot();
            let (action_ref, target_ref) = (&action, &target);
            let executor: &ActionExecutor = self.collaborators.executor.as_ref();
            let outcome = self
                .scheduler
                .schedule(&spec, Some(lease), move |_| executor.perform(action_ref, target_ref))
                .await;
            if let Err(err) = outcome.result {
                if let Some(o) = ctx.recovery_outcome.as_mut() {
                    o.recovered = false;
                }
                self.note_failure(ctx, err);
                return Stage::Failed;
            }
        }
        Stage::Reflection
    }

    async fn reflect(&self, ctx: &mut TaskContext) -> Stage {
        let err = ctx
            .last_error
            .clone()
            .unwrap_or_else(|| TaskError::unknown("reflection without a recorded failure"));
        let spec = OperationSpec::new("replan", "planner", self.scheduler.policy())
            .with_timeout(self.config.planning_timeout)
            .with_max_retries(self.config.stage_max_retries);
        let instruction = ctx.instruction.clone();
        let ui = ctx.ui_state.clone();
        let failed = ctx.failed_action.clone();
        let (instruction, ui, failed, err_ref) =
            (instruction.as_str(), ui.as_ref(), failed.as_ref(), &err);
        let planner: &dyn Planner = self.collaborators.planner.as_ref();

        let outcome = self
            .scheduler
            .schedule(&spec, None, move |_| planner.replan(instruction, ui, failed, err_ref))
            .await;
        match outcome.result {
            Ok(Some(plan)) if !plan.is_empty() => {
                tracing::info!(task_id = %ctx.task_id, steps = plan.len(), "Corrective plan ready");
                ctx.plan = plan;
                ctx.cursor = 0;
                ctx.last_error = None;
                ctx.failed_action = None;
                ctx.failed_operation = None;
                Stage::Execution
            }
            Ok(_) => {
                tracing::warn!(task_id = %ctx.task_id, "No corrective plan, giving up");
                Stage::Failed
            }
            Err(e) => {
                self.note_failure(ctx, e);
                Stage::Failed
            }
        }
    }

    /// 阶段切换；非终态且切换数将达到上限时强制失败
    fn handoff(
        &self,
        ctx: &mut TaskContext,
        next: Stage,
        progress: Option<&watch::Sender<TaskSnapshot>>,
    ) {
        let from = ctx.stage;
        self.events.emit(DispatchEvent::StageExited {
            task_id: ctx.task_id.clone(),
            stage: from,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        let mut next = next;
        if !next.is_terminal() && ctx.handoffs + 1 >= self.config.max_handoffs {
            tracing::warn!(
                task_id = %ctx.task_id,
                handoffs = ctx.handoffs + 1,
                "Handoff budget exceeded"
            );
            self.note_failure(ctx, TaskError::handoff_budget_exceeded(self.config.max_handoffs));
            next = Stage::Failed;
        }
        ctx.handoffs += 1;
        ctx.stage = next;
        tracing::debug!(
            task_id = %ctx.task_id,
            %from,
            to = %next,
            handoffs = ctx.handoffs,
            "Stage handoff"
        );
        self.enter(ctx, progress);
    }

    fn enter(&self, ctx: &TaskContext, progress: Option<&watch::Sender<TaskSnapshot>>) {
        self.events.emit(DispatchEvent::StageEntered {
            task_id: ctx.task_id.clone(),
            stage: ctx.stage,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        if let Some(tx) = progress {
            tx.send_replace(ctx.snapshot());
        }
    }

    fn interrupt(
        &self,
        ctx: &mut TaskContext,
        interrupt: Interrupt,
        progress: Option<&watch::Sender<TaskSnapshot>>,
    ) {
        if ctx.stage.is_terminal() {
            return;
        }
        let err = match interrupt {
            Interrupt::Cancelled => TaskError::cancelled(),
            Interrupt::TimedOut(after) => TaskError::task_timeout(after),
        };
        tracing::warn!(task_id = %ctx.task_id, stage = %ctx.stage, "Task interrupted: {}", err);
        self.note_failure(ctx, err);
        self.handoff(ctx, Stage::Failed, progress);
    }

    /// 记录失败并决定下一阶段：非法输入（validation）直接失败，其余进入恢复
    fn route_failure(
        &self,
        ctx: &mut TaskContext,
        operation: &str,
        action: Option<Action>,
        err: TaskError,
    ) -> Stage {
        let fatal = err.is_fatal();
        self.fail_call(ctx, operation, action, err);
        if fatal {
            tracing::warn!(task_id = %ctx.task_id, operation, "Invalid input, recovery skipped");
            Stage::Failed
        } else {
            Stage::Recovery
        }
    }

    fn fail_call(
        &self,
        ctx: &mut TaskContext,
        operation: &str,
        action: Option<Action>,
        err: TaskError,
    ) {
        ctx.failed_operation = Some(operation.to_string());
        ctx.failed_action = action;
        self.note_failure(ctx, err);
    }

    fn note_failure(&self, ctx: &mut TaskContext, err: TaskError) {
        self.tracker.record(&ctx.task_id, &err);
        self.events.emit(DispatchEvent::Failure {
            task_id: ctx.task_id.clone(),
            stage: ctx.stage,
            error_code: err.code.clone(),
            severity: err.severity,
        });
        ctx.last_error = Some(err);
    }

    fn finish(
        &self,
        mut ctx: TaskContext,
        started: Instant,
        progress: Option<&watch::Sender<TaskSnapshot>>,
    ) -> TaskReport {
        match ctx.stage {
            Stage::Completed => {
                ctx.last_error = None;
                for id in &ctx.dead_letters {
                    self.recovery.resolve(id);
                }
            }
            _ => {
                if ctx.last_error.is_none() {
                    ctx.last_error =
                        Some(TaskError::unknown("task failed without a classified error"));
                }
            }
        }

        let report = ctx.report(started.elapsed());
        self.events.emit(DispatchEvent::TaskFinished {
            task_id: ctx.task_id.clone(),
            stage: ctx.stage,
            duration_ms: report.duration_ms,
        });
        if let Some(tx) = progress {
            tx.send_replace(ctx.snapshot());
        }
        match &report.error {
            None => tracing::info!(
                task_id = %report.task_id,
                handoffs = report.handoffs,
                actions = report.completed_actions,
                "Task completed"
            ),
            Some(err) => tracing::warn!(
                task_id = %report.task_id,
                code = %err.code,
                kind = %err.kind,
                recovery_attempted = report.recovery_attempted,
                "Task failed: {}",
                err.message
            ),
        }
        report
    }
}
