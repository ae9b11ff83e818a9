//! 优雅关闭
//!
//! 统一监听 Ctrl+C / SIGTERM，触发后：
//! - 取消所有在跑任务（任务进入终态并归还设备）
//! - 停止死信 sweep 与设备健康监控
//! - 审计日志在每次写入时已落盘，无需额外 flush

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或调用方主动关闭
    UserInitiated,
    /// SIGTERM 信号
    Signal,
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 获取关闭 token（用于取消正在进行的任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；重复触发只记录第一次
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown triggered");
        self.shutdown_token.cancel();
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling in-flight tasks");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling in-flight tasks");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理，返回清理是否成功
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：管理多个清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 等待清理完成的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    /// 创建新的关闭协调器
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    /// 设置清理超时时间
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 注册清理任务
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务
    ///
    /// 先触发关闭 token（挂在其下的任务取消令牌随之取消），再按注册顺序逐个清理。
    pub async fn run_cleanup(&self) {
        self.manager.shutdown(ShutdownReason::UserInitiated);
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Cleanup task '{}' timed out after {}s",
                        name,
                        self.timeout_secs
                    );
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }
}

/// 取消在跑任务，并等待它们进入终态
pub struct DispatcherCleanup {
    dispatcher: Arc<crate::dispatch::Dispatcher>,
}

impl DispatcherCleanup {
    pub fn new(dispatcher: Arc<crate::dispatch::Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for DispatcherCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let cancelled = self.dispatcher.cancel_all().await;
        if cancelled > 0 {
            tracing::info!("Cancelled {} in-flight tasks", cancelled);
        }
        self.dispatcher.wait_idle().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Dispatcher"
    }
}

/// 停止一个后台循环（死信 sweep、健康监控）：取消 token 并等待其退出
pub struct BackgroundTaskCleanup {
    name: &'static str,
    token: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTaskCleanup {
    pub fn new(
        name: &'static str,
        token: CancellationToken,
        handle: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            name,
            token,
            handle: std::sync::Mutex::new(handle),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("All submitted tasks finished");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
