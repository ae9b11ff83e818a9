//! 协作方能力：感知 / 规划 / 原子动作的接口、注册表、执行器与确定性 mock

pub mod executor;
pub mod mock;
pub mod registry;
pub mod traits;

use std::sync::Arc;

pub use executor::ActionExecutor;
pub use registry::ActionRegistry;
pub use traits::{ActionHandler, HealthCheck, Perception, Planner};

/// 编排器依赖的协作方集合（启动时构造一次）
#[derive(Clone)]
pub struct Collaborators {
    pub perception: Arc<dyn Perception>,
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<ActionExecutor>,
}

impl Collaborators {
    pub fn new(
        perception: Arc<dyn Perception>,
        planner: Arc<dyn Planner>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self {
            perception,
            planner,
            executor,
        }
    }
}
