//! 任务监管：根取消令牌与每任务子令牌
//!
//! 关闭时取消根 token，所有在跑任务的子 token 一并取消；单任务取消只影响它自己。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 进程级任务生命周期管理
#[derive(Debug)]
pub struct TaskSupervisor {
    root: CancellationToken,
    /// 在跑任务的子 token
    tasks: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::with_root(CancellationToken::new())
    }

    /// 挂在外部 token（如关闭管理器）下面
    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 为任务创建子 token 并登记
    pub async fn child_token(&self, task_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.tasks.write().await.insert(task_id.to_string(), token.clone());
        token
    }

    /// 任务进入终态后注销
    pub async fn finish(&self, task_id: &str) {
        self.tasks.write().await.remove(task_id);
    }

    /// 取消单个任务；任务不在跑时返回 false
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部在跑任务，之后不再接受新任务
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
