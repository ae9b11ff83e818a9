//! 调度核心：设备池、熔断、重试调度、死信恢复、阶段编排与运行时装配

pub mod audit;
pub mod builder;
pub mod circuit_breaker;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use audit::{AuditEvent, AuditLog, AuditRecord};
pub use builder::{Runtime, RuntimeBuilder};
pub use circuit_breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use error::{ErrorKind, Severity, TaskError};
pub use health::{HealthConfig, HealthMonitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use pool::{ExecutionTarget, PoolConfig, TargetLease, TargetPool, TargetStatus};
pub use recovery::{FailedOperation, RecoveryConfig, RecoveryManager, RecoveryStrategy};
pub use session_supervisor::TaskSupervisor;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{Action, Stage, TaskContext, TaskReport, TaskRequest, TaskSnapshot};
pub use task_scheduler::{OperationSpec, RetryPolicy, RetryingScheduler};
