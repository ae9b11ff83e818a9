//! 任务错误分类
//!
//! 所有调度、执行、恢复路径都返回带分类的 TaskError（而非 panic / 裸字符串）：
//! kind 决定是否重试，severity 决定恢复策略，suggestions 仅为给人看的提示。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 熔断器打开时的拒绝错误码
pub const CODE_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
/// 单次外部调用超时
pub const CODE_OPERATION_TIMEOUT: &str = "OPERATION_TIMEOUT";
/// 阶段切换次数耗尽
pub const CODE_HANDOFF_BUDGET: &str = "HANDOFF_BUDGET_EXCEEDED";
/// 任务被外部取消
pub const CODE_CANCELLED: &str = "TASK_CANCELLED";
/// 任务级超时
pub const CODE_TASK_TIMEOUT: &str = "TASK_TIMEOUT";
/// 设备池在等待预算内没有可用设备
pub const CODE_NO_TARGET: &str = "NO_TARGET_AVAILABLE";
/// Planner 返回空计划
pub const CODE_EMPTY_PLAN: &str = "EMPTY_PLAN";
/// 动作类型未注册
pub const CODE_UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";

/// 错误类别（决定传播策略）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 设备 / 连接不可用
    Infrastructure,
    Timeout,
    /// 非法输入，永不重试
    Validation,
    /// 设备上某个 UI 动作失败
    ElementInteraction,
    /// 感知 / 规划后端失败
    ExternalDependency,
    Security,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::ElementInteraction => "element_interaction",
            Self::ExternalDependency => "external_dependency",
            Self::Security => "security",
            Self::Unknown => "unknown",
        }
    }

    fn default_code(&self) -> &'static str {
        match self {
            Self::Infrastructure => "INFRASTRUCTURE_ERROR",
            Self::Timeout => CODE_OPERATION_TIMEOUT,
            Self::Validation => "VALIDATION_ERROR",
            Self::ElementInteraction => "ELEMENT_INTERACTION_ERROR",
            Self::ExternalDependency => "EXTERNAL_SERVICE_ERROR",
            Self::Security => "SECURITY_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    fn default_severity(&self) -> Severity {
        match self {
            Self::Validation | Self::Timeout => Severity::Warning,
            Self::Security => Severity::Critical,
            _ => Severity::Error,
        }
    }

    fn default_recoverable(&self) -> bool {
        !matches!(self, Self::Validation | Self::Security)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重程度（Critical 直接升级人工处理）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// 带分类的任务错误：调度器 / 执行器 / 恢复管理器之间传递的唯一错误类型
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub recoverable: bool,
    /// 建议的重试等待（熔断打开时为剩余冷却时间）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    /// 恢复提示（自由文本，不可执行）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: message.into(),
            severity: kind.default_severity(),
            recoverable: kind.default_recoverable(),
            retry_after: None,
            suggestions: Vec::new(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message).with_suggestions([
            "Check device connectivity",
            "Verify the device driver session is alive",
        ])
    }

    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{operation} timed out after {}ms", after.as_millis()),
        )
        .with_suggestions(["Increase the operation timeout", "Check device responsiveness"])
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn element(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ElementInteraction, message).with_suggestions([
            "Re-capture the screen and re-locate the element",
            "Wait for the element to be displayed",
        ])
    }

    pub fn external(dependency: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ExternalDependency,
            format!("{dependency}: {}", message.into()),
        )
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// 熔断器打开：快速失败，携带剩余冷却时间
    pub fn breaker_open(dependency: &str, retry_after: Duration) -> Self {
        let mut err = Self::new(
            ErrorKind::ExternalDependency,
            format!(
                "circuit breaker is open for '{dependency}', retry after {:.1}s",
                retry_after.as_secs_f64()
            ),
        )
        .with_code(CODE_BREAKER_OPEN)
        .with_severity(Severity::Warning);
        err.retry_after = Some(retry_after);
        err
    }

    pub fn handoff_budget_exceeded(max_handoffs: u32) -> Self {
        Self::new(
            ErrorKind::Unknown,
            format!("handoff budget exceeded ({max_handoffs} stage transitions)"),
        )
        .with_code(CODE_HANDOFF_BUDGET)
        .non_recoverable()
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Unknown, "task cancelled")
            .with_code(CODE_CANCELLED)
            .with_severity(Severity::Warning)
            .non_recoverable()
    }

    pub fn task_timeout(after: Duration) -> Self {
        Self::timeout("task", after).with_code(CODE_TASK_TIMEOUT).non_recoverable()
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions.extend(suggestions.into_iter().map(Into::into));
        self
    }

    /// 调度器是否应在本轮预算内立即重试
    pub fn is_retryable(&self) -> bool {
        if !self.recoverable || self.severity == Severity::Critical || self.is_breaker_open() {
            return false;
        }
        matches!(
            self.kind,
            ErrorKind::Infrastructure
                | ErrorKind::Timeout
                | ErrorKind::ElementInteraction
                | ErrorKind::ExternalDependency
        )
    }

    /// 是否应直接失败、不进入恢复（非法输入）
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Validation
    }

    pub fn is_breaker_open(&self) -> bool {
        self.code == CODE_BREAKER_OPEN
    }
}
