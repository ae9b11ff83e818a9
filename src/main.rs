//! AutoRL 调度演示
//!
//! 入口：初始化日志、加载配置、注册设备，把命令行参数作为指令逐条提交，打印 JSON 报告后优雅退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autorl::capabilities::mock::demo_collaborators;
use autorl::config::load_config_or_default;
use autorl::core::pool::ExecutionTarget;
use autorl::core::shutdown::{run_with_graceful_shutdown, ShutdownManager};
use autorl::{RuntimeBuilder, TaskRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autorl::observability::init();

    let config = load_config_or_default(std::env::var_os("AUTORL_CONFIG").map(PathBuf::from));
    let mut instructions: Vec<String> = std::env::args().skip(1).collect();
    if instructions.is_empty() {
        instructions.push("log in".to_string());
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let mut builder = RuntimeBuilder::new(config.clone(), demo_collaborators())
        .with_cancel_root(shutdown.token());
    if config.pool.targets.is_empty() {
        // 未配置设备时注册两个模拟器槽位
        builder = builder.with_targets(vec![
            ExecutionTarget::new("emulator-5554", "android"),
            ExecutionTarget::new("emulator-5556", "android"),
        ]);
    }
    let mut runtime = builder.build().context("Failed to build dispatch runtime")?;
    runtime.start_background();

    let dispatcher = Arc::clone(&runtime.dispatcher);
    let mut task_ids = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        let id = dispatcher
            .submit(TaskRequest::new(instruction))
            .await
            .context("Failed to submit task")?;
        task_ids.push(id);
    }

    let pool = Arc::clone(&runtime.pool);
    let recovery = Arc::clone(&runtime.recovery);
    let tracker = Arc::clone(&runtime.tracker);
    let app = async move {
        let reports =
            futures_util::future::join_all(task_ids.iter().map(|id| dispatcher.wait(id))).await;
        for report in reports.into_iter().flatten() {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!("Report serialization failed: {}", e),
            }
        }
        tracing::info!(
            pool = ?pool.stats(),
            dead_letters = ?recovery.stats(),
            errors = ?tracker.summary(),
            "Dispatch finished"
        );
    };

    let manager = Arc::clone(&shutdown);
    run_with_graceful_shutdown(shutdown, app, move || runtime.shutdown(manager, 5)).await;

    Ok(())
}
