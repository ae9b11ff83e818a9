//! AutoRL - 移动设备自动化调度核心
//!
//! 模块划分：
//! - **capabilities**: 感知 / 规划 / 原子动作的接口、动作注册表与执行器、确定性 mock
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 设备池、熔断、重试调度、死信恢复、阶段编排、关闭与运行时装配
//! - **dispatch**: 任务提交、进度、等待与取消
//! - **observability**: 日志初始化、调度事件总线、错误统计

pub mod capabilities;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod observability;

pub use crate::core::{Runtime, RuntimeBuilder, TaskError, TaskReport, TaskRequest};
pub use dispatch::Dispatcher;
