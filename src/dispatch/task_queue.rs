//! 任务分发器
//!
//! 每个提交的任务在独立的 tokio task 里跑完整个编排流程，并发度由设备池限制。
//!
//! 核心功能：
//! - 提交时分配 task id 与子取消令牌
//! - 通过 watch 通道暴露实时进度
//! - 等待终态报告、取消、清理已结束的旧任务

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::core::error::CODE_CANCELLED;
use crate::core::orchestrator::Orchestrator;
use crate::core::session_supervisor::TaskSupervisor;
use crate::core::state::{TaskContext, TaskReport, TaskRequest, TaskSnapshot};
use crate::core::TaskError;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn from_report(report: &TaskReport) -> Self {
        if report.is_completed() {
            Self::Completed
        } else if report.error.as_ref().is_some_and(|e| e.code == CODE_CANCELLED) {
            Self::Cancelled
        } else {
            Self::Failed
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// 对外可见的任务视图
#[derive(Debug, Clone, Serialize)]
pub struct DispatchedTask {
    pub id: TaskId,
    pub instruction: String,
    pub target_hint: Option<String>,
    pub status: TaskStatus,
    /// 最近一次进度快照
    pub progress: TaskSnapshot,
    /// 终态报告（结束后才有）
    pub report: Option<TaskReport>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

struct TaskEntry {
    instruction: String,
    target_hint: Option<String>,
    created_at: i64,
    completed_at: Option<i64>,
    report: Option<TaskReport>,
    progress: watch::Receiver<TaskSnapshot>,
    done: watch::Receiver<bool>,
}

impl TaskEntry {
    fn status(&self) -> TaskStatus {
        self.report
            .as_ref()
            .map(TaskStatus::from_report)
            .unwrap_or(TaskStatus::Running)
    }

    fn view(&self, id: &str) -> DispatchedTask {
        DispatchedTask {
            id: id.to_string(),
            instruction: self.instruction.clone(),
            target_hint: self.target_hint.clone(),
            status: self.status(),
            progress: self.progress.borrow().clone(),
            report: self.report.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// 任务分发器
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    supervisor: Arc<TaskSupervisor>,
    tasks: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, supervisor: Arc<TaskSupervisor>) -> Self {
        Self {
            orchestrator,
            supervisor,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// 提交新任务；关闭中或指令为空时拒绝
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, TaskError> {
        if request.instruction.trim().is_empty() {
            return Err(TaskError::validation("instruction must not be empty"));
        }
        if self.supervisor.is_shutting_down() {
            return Err(TaskError::infrastructure("dispatcher is shutting down").non_recoverable());
        }

        let task_id = format!("task_{}", uuid::Uuid::new_v4());
        let initial = TaskContext::new(task_id.clone(), request.instruction.clone()).snapshot();
        let (progress_tx, progress_rx) = watch::channel(initial);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = self.supervisor.child_token(&task_id).await;

        self.tasks.write().await.insert(
            task_id.clone(),
            TaskEntry {
                instruction: request.instruction.clone(),
                target_hint: request.target_hint.clone(),
                created_at: chrono::Utc::now().timestamp_millis(),
                completed_at: None,
                report: None,
                progress: progress_rx,
                done: done_rx,
            },
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let supervisor = Arc::clone(&self.supervisor);
        let tasks = Arc::clone(&self.tasks);
        let id = task_id.clone();
        tokio::spawn(async move {
            let report = orchestrator.run(id.clone(), request, cancel, Some(progress_tx)).await;
            supervisor.finish(&id).await;
            if let Some(entry) = tasks.write().await.get_mut(&id) {
                entry.completed_at = Some(chrono::Utc::now().timestamp_millis());
                entry.report = Some(report);
            }
            let _ = done_tx.send(true);
        });

        tracing::info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    pub async fn status(&self, task_id: &str) -> Option<DispatchedTask> {
        self.tasks.read().await.get(task_id).map(|e| e.view(task_id))
    }

    /// 订阅任务进度
    pub async fn progress(&self, task_id: &str) -> Option<watch::Receiver<TaskSnapshot>> {
        self.tasks.read().await.get(task_id).map(|e| e.progress.clone())
    }

    /// 等待任务终态；未知任务返回 None
    pub async fn wait(&self, task_id: &str) -> Option<TaskReport> {
        let mut done = self.tasks.read().await.get(task_id)?.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.tasks.read().await.get(task_id).and_then(|e| e.report.clone())
    }

    /// 取消任务；任务已结束或未知时返回 false
    pub async fn cancel(&self, task_id: &str) -> bool {
        let cancelled = self.supervisor.cancel(task_id).await;
        if cancelled {
            tracing::info!(task_id = %task_id, "Task cancellation requested");
        }
        cancelled
    }

    /// 取消全部在跑任务并拒绝新提交，返回被取消的数量
    pub async fn cancel_all(&self) -> usize {
        let count = self.supervisor.active_count().await;
        self.supervisor.cancel_all();
        count
    }

    /// 等待所有已提交任务进入终态
    pub async fn wait_idle(&self) {
        let running: Vec<TaskId> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.report.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            self.wait(&id).await;
        }
    }

    /// 全部任务（按创建时间排序）
    pub async fn list(&self) -> Vec<DispatchedTask> {
        let tasks = self.tasks.read().await;
        let mut views: Vec<_> = tasks.iter().map(|(id, e)| e.view(id)).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        views
    }

    /// 清理结束超过 max_age 的任务
    pub async fn cleanup_finished(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, e| !e.completed_at.is_some_and(|c| c <= cutoff));
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!("Cleaned up {} finished tasks", removed);
        }
        removed
    }
}
