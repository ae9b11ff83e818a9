//! 调度过程事件：阶段进入 / 退出、动作进度、失败、任务结束
//!
//! 旁路通道：broadcast 发送从不阻塞，没有订阅者时直接丢弃，不影响状态机本身。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::error::Severity;
use crate::core::state::Stage;

/// 单条事件（可序列化为 JSON 供看板 / 指标导出）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    StageEntered {
        task_id: String,
        stage: Stage,
        timestamp: i64,
    },
    StageExited {
        task_id: String,
        stage: Stage,
        timestamp: i64,
    },
    /// 计划中的第 index 个动作执行成功（从 1 开始）
    ActionProgress {
        task_id: String,
        action: String,
        index: usize,
        total: usize,
    },
    Failure {
        task_id: String,
        stage: Stage,
        error_code: String,
        severity: Severity,
    },
    TaskFinished {
        task_id: String,
        stage: Stage,
        duration_ms: u64,
    },
}

impl DispatchEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::StageEntered { task_id, .. }
            | Self::StageExited { task_id, .. }
            | Self::ActionProgress { task_id, .. }
            | Self::Failure { task_id, .. }
            | Self::TaskFinished { task_id, .. } => task_id,
        }
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// 尽力发送
    pub fn emit(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
