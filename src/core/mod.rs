//! 核心层：错误分类、恢复建议、组件装配、优雅关闭

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use builder::{HiveBuilder, HiveComponents};
pub use error::{AgentError, ConnectErrorCode, McpError};
pub use recovery::{RecoveryAdvice, RecoveryEngine};
pub use shutdown::{
    run_with_graceful_shutdown, RegistryCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
