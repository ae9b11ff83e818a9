//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTORL__*` 覆盖（双下划线表示嵌套，如 `AUTORL__POOL__MAX_CONCURRENT=8`）。
//! 每一段都有可用的默认值；启动时一次性转换为各组件自己的配置结构。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::circuit_breaker::BreakerConfig;
use crate::core::health::HealthConfig;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::pool::{ExecutionTarget, PoolConfig};
use crate::core::recovery::RecoveryConfig;
use crate::core::state::Action;
use crate::core::task_scheduler::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub pool: PoolSection,
    pub breaker: BreakerSection,
    pub scheduler: SchedulerSection,
    pub recovery: RecoverySection,
    pub orchestrator: OrchestratorSection,
    pub health: HealthSection,
}

/// [app] 段：应用名、审计日志目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub audit_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "autorl".to_string(),
            audit_dir: PathBuf::from("logs/audit"),
        }
    }
}

/// [pool] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_concurrent: usize,
    pub acquire_timeout_ms: u64,
    pub unhealthy_threshold: u32,
    /// [[pool.targets]]；为空时由调用方决定默认设备
    pub targets: Vec<TargetEntry>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            acquire_timeout_ms: 30_000,
            unhealthy_threshold: 5,
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    pub id: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "android".to_string()
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent: self.max_concurrent.max(1),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            unhealthy_threshold: self.unhealthy_threshold.max(1),
        }
    }

    pub fn to_targets(&self) -> Vec<ExecutionTarget> {
        self.targets
            .iter()
            .map(|t| ExecutionTarget::new(t.id.clone(), t.platform.clone()))
            .collect()
    }
}

/// [breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down_secs: u64,
    pub window_size: usize,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down_secs: 60,
            window_size: 100,
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold(self.failure_threshold.max(1))
            .with_success_threshold(self.success_threshold.max(1))
            .with_cool_down(Duration::from_secs(self.cool_down_secs))
            .with_window_size(self.window_size.max(1))
    }
}

/// [scheduler] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub default_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            default_timeout_secs: 45,
        }
    }
}

impl SchedulerSection {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            backoff_multiplier: self.backoff_multiplier,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
        }
    }
}

/// [recovery] 段：死信 sweep 与审计落盘
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub retry_interval_secs: u64,
    pub max_retries: u32,
    pub max_memory_items: usize,
    pub auto_retry: bool,
    /// 每条审计记录写入后是否 fsync
    pub fsync: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            max_retries: 3,
            max_memory_items: 1000,
            auto_retry: true,
            fsync: true,
        }
    }
}

impl RecoverySection {
    pub fn to_recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            max_retries: self.max_retries,
            max_memory_items: self.max_memory_items,
            auto_retry: self.auto_retry,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_handoffs: u32,
    pub max_recovery_attempts: u32,
    pub perception_timeout_secs: u64,
    pub planning_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub stage_max_retries: u32,
    /// 恢复时先执行的动作类型，如 "back"
    pub safe_state_action: Option<String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_handoffs: 15,
            max_recovery_attempts: 2,
            perception_timeout_secs: 30,
            planning_timeout_secs: 60,
            action_timeout_secs: 45,
            stage_max_retries: 1,
            safe_state_action: None,
        }
    }
}

impl OrchestratorSection {
    /// acquire 超时来自 [pool] 段
    pub fn to_orchestrator_config(&self, acquire_timeout: Duration) -> OrchestratorConfig {
        OrchestratorConfig {
            max_handoffs: self.max_handoffs.max(1),
            max_recovery_attempts: self.max_recovery_attempts,
            acquire_timeout,
            perception_timeout: Duration::from_secs(self.perception_timeout_secs),
            planning_timeout: Duration::from_secs(self.planning_timeout_secs),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            stage_max_retries: self.stage_max_retries,
            safe_state_action: self
                .safe_state_action
                .as_deref()
                .filter(|kind| !kind.trim().is_empty())
                .map(|kind| Action::new(kind, serde_json::Value::Null)),
        }
    }
}

/// [health] 段：unhealthy 设备的定期检查
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub check_timeout_secs: u64,
    /// 标记为 unhealthy 后至少冷却多久才检查
    pub cool_down_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            check_timeout_secs: 5,
            cool_down_secs: 30,
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            check_timeout: Duration::from_secs(self.check_timeout_secs.max(1)),
            cool_down: Duration::from_secs(self.cool_down_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AUTORL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTORL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTORL")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时退回默认配置并告警
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}
