//! 优雅关闭处理
//!
//! 统一的关闭信号监听与清理：
//! - 远程工具调用的退避等待挂在关闭 token 的子 token 上，关闭时立即中断
//! - 清理阶段断开所有远程工具连接
//! - 等待人工审批的工作流只存在于进程内，随进程结束

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 操作员发起 (Ctrl+C 或 quit 命令)
    Operator,
    /// SIGTERM
    Signal,
    /// 致命错误
    Fatal(String),
}

/// 关闭信号管理器：根 token + 最近一次关闭原因
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    reason_tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            root: CancellationToken::new(),
            reason_tx: Arc::new(reason_tx),
        }
    }

    /// 子 token：交给 ServiceRegistry 等组件，关闭时一并取消
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "Shutdown requested");
        self.reason_tx.send_replace(Some(reason));
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C");
                manager.shutdown(ShutdownReason::Operator);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM");
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
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        let timeout = std::time::Duration::from_secs(self.timeout_secs);
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "Cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = name, "Cleanup failed: {}", e),
                Err(_) => tracing::warn!(task = name, "Cleanup timed out after {}s", self.timeout_secs),
            }
        }
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 远程工具连接清理：取消所有退避等待并断开每个服务
pub struct RegistryCleanup {
    registry: Arc<crate::mcp::ServiceRegistry>,
}

impl RegistryCleanup {
    pub fn new(registry: Arc<crate::mcp::ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RegistryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.registry.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ServiceRegistry"
    }
}

/// 运行主应用直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(coordinator: ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    coordinator.manager().install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = coordinator.manager().wait_for_shutdown() => tracing::info!("Shutdown signal received"),
    }

    coordinator.run_cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_child_token_follows_root() {
        let manager = ShutdownManager::new();
        let token = manager.child_token();
        assert!(!token.is_cancelled());
        assert!(manager.reason().is_none());

        manager.shutdown(ShutdownReason::Operator);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::Operator));
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager);
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(FlagCleanup {
            called: called.clone(),
        });

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
