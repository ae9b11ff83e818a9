//! 重试调度：超时 + 指数退避 + 熔断
//!
//! 每次尝试都经过依赖名对应的熔断器，并有独立的超时；超时视为一次可重试的失败。
//! 非可重试错误（非法输入、熔断打开、critical）立即返回，不消耗重试预算。
//! 调度器只更新设备的成功 / 失败计数，不负责归还设备。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::core::circuit_breaker::BreakerRegistry;
use crate::core::pool::TargetLease;
use crate::core::TaskError;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 未显式指定时的单次调用超时
    pub default_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            default_timeout: Duration::from_secs(45),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待：base * multiplier^(attempt-1)，不超过 max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 一次被调度的调用
#[derive(Debug, Clone)]
pub struct OperationSpec {
    /// 操作名（进入审计日志）
    pub name: String,
    /// 熔断器名：perception / planner / device:<id>
    pub dependency: String,
    pub timeout: Duration,
    /// 首次之外的额外尝试次数
    pub max_retries: u32,
}

impl OperationSpec {
    pub fn new(
        name: impl Into<String>,
        dependency: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            dependency: dependency.into(),
            timeout: policy.default_timeout,
            max_retries: policy.max_retries,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// 调度结果：成功值或最后一次错误，附带每次尝试的错误与退避时长
#[derive(Debug)]
pub struct ScheduleOutcome<T> {
    /// 本次调用的 id；审计中单次尝试记为 `{call_id}#{attempt}`
    pub call_id: String,
    pub result: Result<T, TaskError>,
    pub attempts: u32,
    pub attempt_errors: Vec<TaskError>,
    pub delays: Vec<Duration>,
}

impl<T> ScheduleOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, TaskError> {
        self.result
    }
}

/// 带重试的调度器
pub struct RetryingScheduler {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    audit: Option<Arc<AuditLog>>,
}

impl RetryingScheduler {
    pub fn new(policy: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            policy,
            breakers,
            audit: None,
        }
    }

    /// 单次失败写入审计日志
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// 执行 op（参数为第几次尝试，从 1 开始），最多 max_retries + 1 次
    pub async fn schedule<T, F, Fut>(
        &self,
        spec: &OperationSpec,
        lease: Option<&TargetLease>,
        mut op: F,
    ) -> ScheduleOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let breaker = self.breakers.get(&spec.dependency);
        let call_id = uuid::Uuid::new_v4().to_string();
        let max_attempts = spec.max_retries.saturating_add(1);
        let mut attempt_errors: Vec<TaskError> = Vec::new();
        let mut delays = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let fut = op(attempt);
            let timeout = spec.timeout;
            let name = spec.name.as_str();
            let result = breaker
                .call(|| async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(TaskError::timeout(name, timeout)),
                    }
                })
                .await;

            match result {
                Ok(value) => {
                    if let Some(lease) = lease {
                        lease.record_success(started.elapsed());
                    }
                    if !attempt_errors.is_empty() {
                        tracing::info!(
                            operation = %spec.name,
                            attempts = attempt,
                            "Operation succeeded after retries"
                        );
                        for (i, err) in attempt_errors.iter().enumerate() {
                            let attempt = i as u32 + 1;
                            self.audit_attempt(AuditEvent::Resolved, spec, &call_id, attempt, err);
                        }
                    }
                    return ScheduleOutcome {
                        call_id,
                        result: Ok(value),
                        attempts: attempt,
                        attempt_errors,
                        delays,
                    };
                }
                Err(err) => {
                    if let Some(lease) = lease {
                        if !err.is_breaker_open() && !err.is_fatal() {
                            lease.record_failure();
                        }
                    }
                    self.audit_attempt(AuditEvent::AttemptFailed, spec, &call_id, attempt, &err);
                    attempt_errors.push(err.clone());

                    if !err.is_retryable() || attempt >= max_attempts {
                        tracing::warn!(
                            operation = %spec.name,
                            dependency = %spec.dependency,
                            attempts = attempt,
                            code = %err.code,
                            "Operation failed: {}",
                            err.message
                        );
                        return ScheduleOutcome {
                            call_id,
                            result: Err(err),
                            attempts: attempt,
                            attempt_errors,
                            delays,
                        };
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        operation = %spec.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        err
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn audit_attempt(
        &self,
        event: AuditEvent,
        spec: &OperationSpec,
        call_id: &str,
        attempt: u32,
        err: &TaskError,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let record = AuditRecord {
            event,
            operation_id: format!("{call_id}#{attempt}"),
            operation_name: spec.name.clone(),
            error_code: err.code.clone(),
            severity: err.severity.as_str().to_string(),
            retry_count: attempt - 1,
            strategy: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            resolved: event == AuditEvent::Resolved,
        };
        if let Err(e) = audit.append(&record) {
            tracing::error!(error = %e, operation = %spec.name, "Failed to write audit record");
        }
    }
}
