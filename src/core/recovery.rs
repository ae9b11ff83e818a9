//! 恢复管理器 / 死信队列
//!
//! 调度器重试耗尽的调用在这里登记为 FailedOperation：先同步写审计日志，再更新内存队列。
//! 策略按错误自动选择（不可恢复或 critical → escalate，否则 retry），也可由调用方指定。
//! retry 由后台 sweep 按冷却间隔重放；ignore 直接标记解决；escalate 只记录、等待人工处理，从不自动重试。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::core::error::Severity;
use crate::core::TaskError;

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Ignore,
    Escalate,
}

impl RecoveryStrategy {
    /// 按错误自动选择策略
    pub fn for_error(err: &TaskError) -> Self {
        if !err.recoverable || err.severity == Severity::Critical {
            Self::Escalate
        } else {
            Self::Retry
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Ignore => "ignore",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条死信
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation_id: String,
    pub operation_name: String,
    pub error: TaskError,
    /// 毫秒时间戳
    pub created_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub strategy: RecoveryStrategy,
    /// 重放所需的上下文（任务 id、设备、动作等）
    pub context: serde_json::Value,
    pub resolved: bool,
    pub last_retry_at: Option<i64>,
}

/// recover 的结果
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub operation_id: String,
    pub strategy: RecoveryStrategy,
    /// 策略处理是否成功（escalate 永远为 false）
    pub recovered: bool,
}

/// 策略处理器的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryVerdict {
    /// 已处理完毕，标记解决
    Resolved,
    /// 留在队列里等待后续重放 / 解决
    Deferred,
    /// 处理失败，需要人工介入
    Unrecovered,
}

/// 可插拔的策略处理器
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn handle(&self, op: &FailedOperation) -> RecoveryVerdict;
}

/// retry 的默认处理：交给 sweep / 编排器的 reflection 继续
pub struct DeferRetry;

#[async_trait]
impl RecoveryHandler for DeferRetry {
    async fn handle(&self, op: &FailedOperation) -> RecoveryVerdict {
        tracing::info!(
            operation_id = %op.operation_id,
            operation = %op.operation_name,
            "Dead letter queued for retry"
        );
        RecoveryVerdict::Deferred
    }
}

/// ignore 的默认处理
pub struct MarkResolved;

#[async_trait]
impl RecoveryHandler for MarkResolved {
    async fn handle(&self, _op: &FailedOperation) -> RecoveryVerdict {
        RecoveryVerdict::Resolved
    }
}

/// escalate 的默认处理：以最高级别记录，等待人工
pub struct LogEscalation;

#[async_trait]
impl RecoveryHandler for LogEscalation {
    async fn handle(&self, op: &FailedOperation) -> RecoveryVerdict {
        tracing::error!(
            operation_id = %op.operation_id,
            operation = %op.operation_name,
            code = %op.error.code,
            severity = op.error.severity.as_str(),
            retry_count = op.retry_count,
            "ESCALATION REQUIRED: {}",
            op.error.message
        );
        RecoveryVerdict::Unrecovered
    }
}

/// sweep 重放死信的回调
pub type RetryFn =
    Arc<dyn Fn(FailedOperation) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// 恢复管理器配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// sweep 间隔，同时是单条死信两次重放之间的冷却
    pub retry_interval: Duration,
    pub max_retries: u32,
    /// 内存中最多保留多少条（只淘汰已解决的）
    pub max_memory_items: usize,
    pub auto_retry: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            max_retries: 3,
            max_memory_items: 1000,
            auto_retry: true,
        }
    }
}

/// 死信统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub resolved: usize,
    pub pending: usize,
    /// 未解决的按策略 / 严重程度计数
    pub by_strategy: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
}

struct Entry {
    op: FailedOperation,
    created: Instant,
    last_retry: Option<Instant>,
    in_flight: bool,
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    audit: Arc<AuditLog>,
    queue: Mutex<Vec<Entry>>,
    retry_handler: Arc<dyn RecoveryHandler>,
    ignore_handler: Arc<dyn RecoveryHandler>,
    escalate_handler: Arc<dyn RecoveryHandler>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            audit,
            queue: Mutex::new(Vec::new()),
            retry_handler: Arc::new(DeferRetry),
            ignore_handler: Arc::new(MarkResolved),
            escalate_handler: Arc::new(LogEscalation),
        }
    }

    /// 替换某个策略的处理器
    pub fn with_handler(
        mut self,
        strategy: RecoveryStrategy,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Self {
        match strategy {
            RecoveryStrategy::Retry => self.retry_handler = handler,
            RecoveryStrategy::Ignore => self.ignore_handler = handler,
            RecoveryStrategy::Escalate => self.escalate_handler = handler,
        }
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_audit(&self, event: AuditEvent, op: &FailedOperation) {
        let record = AuditRecord {
            event,
            operation_id: op.operation_id.clone(),
            operation_name: op.operation_name.clone(),
            error_code: op.error.code.clone(),
            severity: op.error.severity.as_str().to_string(),
            retry_count: op.retry_count,
            strategy: Some(op.strategy),
            timestamp: chrono::Utc::now().timestamp_millis(),
            resolved: op.resolved,
        };
        if let Err(e) = self.audit.append(&record) {
            // 内存队列照常更新，进程存活期间不丢失
            tracing::error!(
                operation_id = %op.operation_id,
                error = %e,
                "Failed to persist audit record"
            );
        }
    }

    /// 登记一条死信，返回 operation_id
    pub fn record(
        &self,
        name: &str,
        error: TaskError,
        context: serde_json::Value,
        strategy: Option<RecoveryStrategy>,
        max_retries: Option<u32>,
    ) -> String {
        let strategy = strategy.unwrap_or_else(|| RecoveryStrategy::for_error(&error));
        let op = FailedOperation {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation_name: name.to_string(),
            error,
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.config.max_retries),
            strategy,
            context,
            resolved: false,
            last_retry_at: None,
        };
        self.write_audit(AuditEvent::DeadLetter, &op);

        tracing::warn!(
            operation_id = %op.operation_id,
            operation = %op.operation_name,
            code = %op.error.code,
            strategy = %strategy,
            "Operation moved to dead letter queue: {}",
            op.error.message
        );

        let id = op.operation_id.clone();
        let mut queue = self.lock();
        queue.push(Entry {
            op,
            created: Instant::now(),
            last_retry: None,
            in_flight: false,
        });
        self.evict(&mut queue);
        id
    }

    fn evict(&self, queue: &mut Vec<Entry>) {
        let mut excess = queue.len().saturating_sub(self.config.max_memory_items);
        if excess == 0 {
            return;
        }
        queue.retain(|e| {
            if excess > 0 && e.op.resolved {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// 登记并立即执行策略处理器
    pub async fn recover(
        &self,
        name: &str,
        error: TaskError,
        context: serde_json::Value,
        strategy: Option<RecoveryStrategy>,
    ) -> RecoveryOutcome {
        let operation_id = self.record(name, error, context, strategy, None);
        let Some(op) = self.get(&operation_id) else {
            return RecoveryOutcome {
                operation_id,
                strategy: strategy.unwrap_or(RecoveryStrategy::Escalate),
                recovered: false,
            };
        };

        let verdict = match op.strategy {
            RecoveryStrategy::Escalate => self.escalate(&op).await,
            RecoveryStrategy::Retry => self.retry_handler.handle(&op).await,
            RecoveryStrategy::Ignore => self.ignore_handler.handle(&op).await,
        };
        if verdict == RecoveryVerdict::Resolved {
            self.resolve(&operation_id);
        }
        RecoveryOutcome {
            operation_id,
            strategy: op.strategy,
            recovered: verdict != RecoveryVerdict::Unrecovered,
        }
    }

    async fn escalate(&self, op: &FailedOperation) -> RecoveryVerdict {
        self.write_audit(AuditEvent::Escalated, op);
        self.escalate_handler.handle(op).await
    }

    pub fn get(&self, operation_id: &str) -> Option<FailedOperation> {
        self.lock()
            .iter()
            .find(|e| e.op.operation_id == operation_id)
            .map(|e| e.op.clone())
    }

    /// 未解决的死信（可按策略过滤），按登记顺序
    pub fn pending(&self, strategy: Option<RecoveryStrategy>) -> Vec<FailedOperation> {
        self.lock()
            .iter()
            .filter(|e| !e.op.resolved && strategy.map_or(true, |s| e.op.strategy == s))
            .map(|e| e.op.clone())
            .collect()
    }

    /// 可以重放的死信：retry 策略、未耗尽、冷却已过、当前没有在重放
    pub fn retryable(&self) -> Vec<FailedOperation> {
        let interval = self.config.retry_interval;
        self.lock()
            .iter()
            .filter(|e| {
                !e.op.resolved
                    && !e.in_flight
                    && e.op.strategy == RecoveryStrategy::Retry
                    && e.op.retry_count < e.op.max_retries
                    && e.last_retry.unwrap_or(e.created).elapsed() >= interval
            })
            .map(|e| e.op.clone())
            .collect()
    }

    /// 重放一条死信；成功则标记解决。耗尽预算时触发一次 escalate
    pub async fn attempt_retry(&self, operation_id: &str, retry_fn: &RetryFn) -> bool {
        let op = {
            let mut queue = self.lock();
            let Some(entry) = queue.iter_mut().find(|e| e.op.operation_id == operation_id) else {
                return false;
            };
            let exhausted = entry.op.retry_count >= entry.op.max_retries;
            if entry.op.resolved || entry.in_flight || exhausted {
                return false;
            }
            entry.in_flight = true;
            entry.op.clone()
        };

        let result = retry_fn(op).await;

        let (updated, exhausted) = {
            let mut queue = self.lock();
            let Some(entry) = queue.iter_mut().find(|e| e.op.operation_id == operation_id) else {
                return result.is_ok();
            };
            entry.in_flight = false;
            if entry.op.resolved {
                // 重放期间已被 resolve（例如所属任务已完成），结果作废
                tracing::debug!(operation_id = %operation_id, "Dead letter resolved during replay");
                return false;
            }
            let mut updated = entry.op.clone();
            updated.retry_count += 1;
            updated.last_retry_at = Some(chrono::Utc::now().timestamp_millis());
            if let Err(err) = &result {
                updated.error = err.clone();
            }
            updated.resolved = result.is_ok();

            self.write_audit(AuditEvent::Retried, &updated);
            if updated.resolved {
                self.write_audit(AuditEvent::Resolved, &updated);
            }

            entry.op = updated.clone();
            entry.last_retry = Some(Instant::now());
            let exhausted = !updated.resolved && updated.retry_count >= updated.max_retries;
            (updated, exhausted)
        };

        match &result {
            Ok(()) => tracing::info!(
                operation_id = %operation_id,
                retry_count = updated.retry_count,
                "Dead letter recovered by retry"
            ),
            Err(err) => tracing::warn!(
                operation_id = %operation_id,
                retry_count = updated.retry_count,
                max_retries = updated.max_retries,
                "Dead letter retry failed: {}",
                err
            ),
        }
        if exhausted {
            self.escalate(&updated).await;
        }
        result.is_ok()
    }

    /// 标记解决；未知或已解决返回 false
    pub fn resolve(&self, operation_id: &str) -> bool {
        let mut queue = self.lock();
        let Some(entry) = queue
            .iter_mut()
            .find(|e| e.op.operation_id == operation_id && !e.op.resolved)
        else {
            return false;
        };
        let mut resolved = entry.op.clone();
        resolved.resolved = true;
        self.write_audit(AuditEvent::Resolved, &resolved);
        entry.op = resolved;
        tracing::info!(operation_id = %operation_id, "Dead letter resolved");
        true
    }

    /// 一轮 sweep：重放当前所有可重放的死信，返回成功数
    pub async fn sweep_once(&self, retry_fn: &RetryFn) -> usize {
        let candidates = self.retryable();
        if candidates.is_empty() {
            return 0;
        }
        tracing::debug!(count = candidates.len(), "Sweeping dead letters");
        let mut recovered = 0;
        for op in candidates {
            if self.attempt_retry(&op.operation_id, retry_fn).await {
                recovered += 1;
            }
        }
        recovered
    }

    /// 后台 sweep；auto_retry 关闭时不启动
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        retry_fn: RetryFn,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.config.auto_retry {
            tracing::info!("Dead letter auto retry disabled");
            return None;
        }
        let manager = Arc::clone(self);
        let interval = self.config.retry_interval;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.sweep_once(&retry_fn).await;
                    }
                }
            }
            tracing::debug!("Dead letter sweeper stopped");
        }))
    }

    pub fn stats(&self) -> RecoveryStats {
        let queue = self.lock();
        let mut stats = RecoveryStats {
            total: queue.len(),
            ..RecoveryStats::default()
        };
        for e in queue.iter() {
            if e.op.resolved {
                stats.resolved += 1;
                continue;
            }
            stats.pending += 1;
            *stats.by_strategy.entry(e.op.strategy.as_str().to_string()).or_default() += 1;
            *stats
                .by_severity
                .entry(e.op.error.severity.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    /// 从内存中移除已解决的死信（审计日志不受影响）
    pub fn clear_resolved(&self) -> usize {
        let mut queue = self.lock();
        let before = queue.len();
        queue.retain(|e| !e.op.resolved);
        before - queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn manager(dir: &TempDir, interval_ms: u64) -> RecoveryManager {
        RecoveryManager::new(
            RecoveryConfig {
                retry_interval: Duration::from_millis(interval_ms),
                max_retries: 2,
                max_memory_items: 100,
                auto_retry: true,
            },
            Arc::new(AuditLog::new(dir.path(), false)),
        )
    }

    fn failing_retry(calls: Arc<AtomicU32>) -> RetryFn {
        Arc::new(move |_op| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::element("still failing")) }.boxed()
        })
    }

    fn ok_retry() -> RetryFn {
        Arc::new(|_op| async { Ok(()) }.boxed())
    }

    struct Counting(AtomicU32);

    #[async_trait]
    impl RecoveryHandler for Counting {
        async fn handle(&self, _op: &FailedOperation) -> RecoveryVerdict {
            self.0.fetch_add(1, Ordering::SeqCst);
            RecoveryVerdict::Unrecovered
        }
    }

    #[tokio::test]
    async fn test_resolve_during_replay_is_not_undone() {
        let dir = TempDir::new().unwrap();
        let m = Arc::new(manager(&dir, 10));
        let id = m.record(
            "tap",
            TaskError::element("gone"),
            serde_json::json!({}),
            Some(RecoveryStrategy::Retry),
            Some(1),
        );

        let gate = Arc::new(tokio::sync::Notify::new());
        let retry_gate = Arc::clone(&gate);
        let retry: RetryFn = Arc::new(move |_op| {
            let gate = Arc::clone(&retry_gate);
            async move {
                gate.notified().await;
                Err(TaskError::element("stale screen"))
            }
            .boxed()
        });
        let replay = {
            let m = Arc::clone(&m);
            let id = id.clone();
            tokio::spawn(async move { m.attempt_retry(&id, &retry).await })
        };
        tokio::task::yield_now().await;

        assert!(m.resolve(&id));
        gate.notify_one();
        assert!(!replay.await.unwrap());

        let op = m.get(&id).unwrap();
        assert!(op.resolved);
        assert_eq!(op.retry_count, 0);
        assert_eq!(m.stats().pending, 0);

        let records = m.audit().read_records().unwrap();
        assert!(records
            .iter()
            .all(|r| !matches!(r.event, AuditEvent::Retried | AuditEvent::Escalated)));
        assert!(m.audit().unresolved_dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            RecoveryStrategy::for_error(&TaskError::element("x")),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            RecoveryStrategy::for_error(&TaskError::security("x")),
            RecoveryStrategy::Escalate
        );
        assert_eq!(
            RecoveryStrategy::for_error(
                &TaskError::infrastructure("x").with_severity(Severity::Critical)
            ),
            RecoveryStrategy::Escalate
        );
    }

    #[test]
    fn test_record_persists_before_queue() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let context = serde_json::json!({"step": 2});
        let id = m.record("tap", TaskError::element("gone"), context, None, None);

        let records = m.audit().read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_id, id);
        assert_eq!(records[0].event, AuditEvent::DeadLetter);
        assert_eq!(records[0].strategy, Some(RecoveryStrategy::Retry));
        assert!(!records[0].resolved);

        assert_eq!(m.pending(None).len(), 1);
        assert_eq!(m.pending(Some(RecoveryStrategy::Escalate)).len(), 0);
        assert_eq!(m.get(&id).unwrap().max_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_respects_cool_down() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 1000);
        let id = m.record("tap", TaskError::element("gone"), serde_json::Value::Null, None, None);
        m.record("wipe", TaskError::security("no"), serde_json::Value::Null, None, None);

        assert!(m.retryable().is_empty());
        tokio::time::advance(Duration::from_millis(1001)).await;
        let ready = m.retryable();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].operation_id, id);

        let calls = Arc::new(AtomicU32::new(0));
        assert!(!m.attempt_retry(&id, &failing_retry(Arc::clone(&calls))).await);
        assert!(m.retryable().is_empty());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(m.retryable().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_max_and_escalates_once() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(Counting(AtomicU32::new(0)));
        let m = manager(&dir, 0).with_handler(RecoveryStrategy::Escalate, counter.clone());
        let id = m.record("tap", TaskError::element("gone"), serde_json::Value::Null, None, None);

        let calls = Arc::new(AtomicU32::new(0));
        let retry = failing_retry(Arc::clone(&calls));
        for _ in 0..5 {
            m.attempt_retry(&id, &retry).await;
        }
        let op = m.get(&id).unwrap();
        assert_eq!(op.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!op.resolved);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(m.retryable().is_empty());
    }

    #[tokio::test]
    async fn test_successful_retry_resolves() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 0);
        let id = m.record("tap", TaskError::element("gone"), serde_json::Value::Null, None, None);

        assert_eq!(m.sweep_once(&ok_retry()).await, 1);
        assert!(m.get(&id).unwrap().resolved);
        assert!(m.pending(None).is_empty());
        assert!(m.audit().unresolved_dead_letters().unwrap().is_empty());
        assert_eq!(m.clear_resolved(), 1);
        assert!(m.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_recover_applies_strategy_handlers() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 0);

        let retry = m
            .recover("tap", TaskError::element("gone"), serde_json::Value::Null, None)
            .await;
        assert_eq!(retry.strategy, RecoveryStrategy::Retry);
        assert!(retry.recovered);
        assert!(!m.get(&retry.operation_id).unwrap().resolved);

        let ignore = m
            .recover(
                "scroll",
                TaskError::element("nothing to scroll"),
                serde_json::Value::Null,
                Some(RecoveryStrategy::Ignore),
            )
            .await;
        assert!(ignore.recovered);
        assert!(m.get(&ignore.operation_id).unwrap().resolved);

        let escalate = m
            .recover("wipe", TaskError::security("denied"), serde_json::Value::Null, None)
            .await;
        assert_eq!(escalate.strategy, RecoveryStrategy::Escalate);
        assert!(!escalate.recovered);

        // escalate 从不自动重试
        assert_eq!(m.sweep_once(&ok_retry()).await, 1);
        assert!(!m.get(&escalate.operation_id).unwrap().resolved);

        let stats = m.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.by_strategy.get("escalate"), Some(&1));
    }

    #[test]
    fn test_memory_bound_evicts_only_resolved() {
        let dir = TempDir::new().unwrap();
        let m = RecoveryManager::new(
            RecoveryConfig {
                max_memory_items: 2,
                ..RecoveryConfig::default()
            },
            Arc::new(AuditLog::new(dir.path(), false)),
        );
        let a = m.record("a", TaskError::element("x"), serde_json::Value::Null, None, None);
        let b = m.record("b", TaskError::element("x"), serde_json::Value::Null, None, None);
        m.resolve(&a);
        m.record("c", TaskError::element("x"), serde_json::Value::Null, None, None);
        assert!(m.get(&a).is_none());
        assert!(m.get(&b).is_some());

        m.record("d", TaskError::element("x"), serde_json::Value::Null, None, None);
        assert_eq!(m.stats().total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let m = Arc::new(manager(&dir, 100));
        let id = m.record("tap", TaskError::element("gone"), serde_json::Value::Null, None, None);

        let cancel = CancellationToken::new();
        let handle = m.spawn_sweeper(ok_retry(), cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(m.get(&id).unwrap().resolved);

        cancel.cancel();
        handle.await.unwrap();
    }
}
