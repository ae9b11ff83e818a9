//! 可观测性：tracing 初始化、调度事件总线、错误统计

pub mod events;
pub mod tracker;

pub use events::{DispatchEvent, EventBus};
pub use tracker::{ErrorTracker, TrackerSummary};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可用 RUST_LOG 覆盖；重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
