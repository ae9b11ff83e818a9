//! 任务状态：阶段、TaskContext 与对外投影
//!
//! TaskContext 只由运行该任务的那一个逻辑流修改；外部只看到投影出来的 TaskSnapshot / TaskReport。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{ErrorKind, Severity};
use crate::core::recovery::RecoveryOutcome;
use crate::core::TaskError;

/// 流水线阶段（含两个终态）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Perception,
    Planning,
    Execution,
    Recovery,
    Reflection,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Perception => "perception",
            Self::Planning => "planning",
            Self::Execution => "execution",
            Self::Recovery => "recovery",
            Self::Reflection => "reflection",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个原子动作（tap / type_text / swipe ...）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Action {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.params.is_null() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}({})", self.kind, self.params)
        }
    }
}

/// 感知结果（对调度核心是不透明的结构化快照）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiSnapshot {
    pub captured_at: i64,
    pub data: serde_json::Value,
}

impl UiSnapshot {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            captured_at: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// 提交一个任务所需的参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instruction: String,
    #[serde(default)]
    pub target_hint: Option<String>,
    /// 整个任务的超时；None 表示不限
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// 每个动作的额外重试次数；None 用调度器默认值
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            target_hint: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_hint = Some(target_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 流经各阶段的任务上下文
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: String,
    pub instruction: String,
    pub target_id: Option<String>,
    pub stage: Stage,
    pub ui_state: Option<UiSnapshot>,
    pub plan: Vec<Action>,
    /// 当前计划中下一个要执行的动作下标
    pub cursor: usize,
    /// 跨计划累计成功的动作数
    pub completed_actions: usize,
    pub failed_action: Option<Action>,
    /// 最近一次失败的调用名（进入死信队列时使用）
    pub failed_operation: Option<String>,
    pub last_error: Option<TaskError>,
    /// 阶段切换次数（单调递增）
    pub handoffs: u32,
    /// 已使用的恢复次数（单调递增）
    pub recovery_attempts: u32,
    pub recovery_outcome: Option<RecoveryOutcome>,
    /// 本任务登记的死信 id
    pub dead_letters: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: i64,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            instruction: instruction.into(),
            target_id: None,
            stage: Stage::Perception,
            ui_state: None,
            plan: Vec::new(),
            cursor: 0,
            completed_actions: 0,
            failed_action: None,
            failed_operation: None,
            last_error: None,
            handoffs: 0,
            recovery_attempts: 0,
            recovery_outcome: None,
            dead_letters: Vec::new(),
            metadata: HashMap::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            stage: self.stage,
            target_id: self.target_id.clone(),
            handoffs: self.handoffs,
            plan_len: self.plan.len(),
            plan_cursor: self.cursor,
            completed_actions: self.completed_actions,
            last_error: self.last_error.as_ref().map(|e| e.code.clone()),
        }
    }

    /// 投影为调用方可见的报告
    pub fn report(&self, duration: Duration) -> TaskReport {
        TaskReport {
            task_id: self.task_id.clone(),
            instruction: self.instruction.clone(),
            stage: self.stage,
            target_id: self.target_id.clone(),
            handoffs: self.handoffs,
            completed_actions: self.completed_actions,
            error: self.last_error.as_ref().map(ErrorSummary::from),
            recovery_attempted: self.recovery_attempts > 0,
            recovery_attempts: self.recovery_attempts,
            recovery_outcome: self.recovery_outcome.clone(),
            dead_letters: self.dead_letters.clone(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// 任务进度快照（status 查询 / watch 广播）
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub stage: Stage,
    pub target_id: Option<String>,
    pub handoffs: u32,
    pub plan_len: usize,
    pub plan_cursor: usize,
    pub completed_actions: usize,
    pub last_error: Option<String>,
}

/// 错误摘要（不含堆栈）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl From<&TaskError> for ErrorSummary {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind,
            code: err.code.clone(),
            message: err.message.clone(),
            severity: err.severity,
        }
    }
}

/// 任务终态报告
#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub instruction: String,
    pub stage: Stage,
    pub target_id: Option<String>,
    pub handoffs: u32,
    pub completed_actions: usize,
    /// 失败时必有
    pub error: Option<ErrorSummary>,
    pub recovery_attempted: bool,
    pub recovery_attempts: u32,
    pub recovery_outcome: Option<RecoveryOutcome>,
    pub dead_letters: Vec<String>,
    pub duration_ms: u64,
}

impl TaskReport {
    pub fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_starts_in_perception() {
        let ctx = TaskContext::new("t-1", "log in");
        assert_eq!(ctx.stage, Stage::Perception);
        assert!(!ctx.stage.is_terminal());
        assert_eq!(ctx.handoffs, 0);
    }

    #[test]
    fn test_report_projects_error_and_recovery() {
        let mut ctx = TaskContext::new("t-1", "log in");
        ctx.stage = Stage::Failed;
        ctx.last_error = Some(TaskError::element("tap failed"));
        ctx.recovery_attempts = 1;
        let report = ctx.report(Duration::from_millis(1500));

        assert!(!report.is_completed());
        assert!(report.recovery_attempted);
        let err = report.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ElementInteraction);
        assert_eq!(report.duration_ms, 1500);
    }

    #[test]
    fn test_stage_and_action_display() {
        assert_eq!(Stage::Reflection.to_string(), "reflection");
        assert!(Stage::Completed.is_terminal());
        let tap = Action::new("tap", serde_json::json!({"element": "login_button"}));
        assert_eq!(tap.to_string(), r#"tap({"element":"login_button"})"#);
        assert_eq!(Action::new("back", serde_json::Value::Null).to_string(), "back");
    }
}
