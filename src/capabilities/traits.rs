//! 外部协作方接口：感知、规划、原子动作
//!
//! 具体实现（截图 + 视觉模型、LLM 规划、Appium 驱动）不在调度核心内，启动时显式注入。

use async_trait::async_trait;

use crate::core::pool::ExecutionTarget;
use crate::core::state::{Action, UiSnapshot};
use crate::core::TaskError;

/// 感知：抓取设备当前界面
#[async_trait]
pub trait Perception: Send + Sync {
    async fn capture(&self, target: &ExecutionTarget) -> Result<UiSnapshot, TaskError>;
}

/// 规划：指令 + 界面 → 有序动作列表
#[async_trait]
pub trait Planner: Send + Sync {
    /// 可以返回空计划（编排器会转入 reflection）
    async fn plan(&self, instruction: &str, ui: &UiSnapshot) -> Result<Vec<Action>, TaskError>;

    /// 根据失败给出修正计划；None 表示无法修正
    async fn replan(
        &self,
        instruction: &str,
        ui: Option<&UiSnapshot>,
        failed_action: Option<&Action>,
        error: &TaskError,
    ) -> Result<Option<Vec<Action>>, TaskError>;
}

/// 单类原子动作的执行器（tap / type_text / swipe ...）
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// 动作类型（与 Action::kind 对应）
    fn kind(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn perform(&self, action: &Action, target: &ExecutionTarget) -> Result<(), TaskError>;
}

/// 设备健康检查（心跳 / adb 连通性等）；由健康监控对 unhealthy 设备调用
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, target: &ExecutionTarget) -> Result<(), TaskError>;
}
