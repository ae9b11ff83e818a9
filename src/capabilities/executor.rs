//! 动作执行器
//!
//! 持有 ActionRegistry，perform(action, target) 转发给对应 handler；每次调用输出结构化审计日志（JSON）。
//! 超时与重试由调度器负责，这里不再额外加超时。

use std::time::Instant;

use crate::capabilities::ActionRegistry;
use crate::core::pool::ExecutionTarget;
use crate::core::state::Action;
use crate::core::TaskError;

pub struct ActionExecutor {
    registry: ActionRegistry,
}

impl ActionExecutor {
    pub fn new(registry: ActionRegistry) -> Self {
        Self { registry }
    }

    pub async fn perform(
        &self,
        action: &Action,
        target: &ExecutionTarget,
    ) -> Result<(), TaskError> {
        let start = Instant::now();
        let params_preview = params_preview(&action.params);
        let result = self.registry.perform(action, target).await;

        let outcome = match &result {
            Ok(()) => "ok".to_string(),
            Err(e) => e.code.clone(),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": action.kind,
            "target": target.id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "params_preview": params_preview,
        });
        tracing::info!(audit = %audit.to_string(), "action");
        result
    }

    pub fn kinds(&self) -> Vec<String> {
        self.registry.kinds()
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }
}

fn params_preview(params: &serde_json::Value) -> String {
    let s = params.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
