//! 任务分发：提交、状态查询、等待、取消与清理

pub mod task_queue;

pub use task_queue::{DispatchedTask, Dispatcher, TaskId, TaskStatus};
