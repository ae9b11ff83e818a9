//! 动作注册表：按 kind 静态注册 ActionHandler

use std::collections::HashMap;
use std::sync::Arc;

use crate::capabilities::ActionHandler;
use crate::core::error::CODE_UNKNOWN_ACTION;
use crate::core::pool::ExecutionTarget;
use crate::core::state::Action;
use crate::core::TaskError;

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名 kind 会被覆盖
    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn ActionHandler>) {
        let kind = handler.kind().to_string();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!(kind = %kind, "Action handler replaced");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// 未注册的 kind 返回 validation 错误（不重试、不恢复）
    pub async fn perform(
        &self,
        action: &Action,
        target: &ExecutionTarget,
    ) -> Result<(), TaskError> {
        let handler = self.handlers.get(&action.kind).ok_or_else(|| {
            TaskError::validation(format!("unknown action kind: {}", action.kind))
                .with_code(CODE_UNKNOWN_ACTION)
        })?;
        handler.perform(action, target).await
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// (kind, description)，供规划器生成可用动作列表
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .handlers
            .iter()
            .map(|(kind, h)| (kind.clone(), h.description().to_string()))
            .collect();
        list.sort();
        list
    }
}
