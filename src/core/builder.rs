//! 构建器：统一的装配逻辑
//!
//! 控制台与 HTTP 服务共用同一套组装：服务注册表、Agent 集合、规划器、持久化与编排器。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::mcp::{HttpTransportFactory, ServiceRegistry, TransportFactory};
use crate::observability::TracingHealthSink;
use crate::workflow::{
    AgentRegistry, EventSink, InMemoryPersistence, InMemoryWorkflowStore, JsonlPersistence,
    KeywordPlanner, LogEventSink, Persistence, WorkflowOrchestrator, WorkflowStore,
};

/// 装配完成的组件
pub struct HiveComponents {
    pub registry: Arc<ServiceRegistry>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

pub struct HiveBuilder {
    config: AppConfig,
    factory: Arc<dyn TransportFactory>,
    events: Arc<dyn EventSink>,
    store: Arc<dyn WorkflowStore>,
    persistence: Option<Arc<dyn Persistence>>,
    cancel: CancellationToken,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            factory: Arc::new(HttpTransportFactory::default()),
            events: Arc::new(LogEventSink),
            store: Arc::new(InMemoryWorkflowStore::new()),
            persistence: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 远程调用的取消作用域（通常是 ShutdownManager 的子 token）
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 未显式指定时：配置了 persistence_path 用 JSONL 文件，否则内存
    fn persistence(&self) -> Arc<dyn Persistence> {
        if let Some(p) = &self.persistence {
            return Arc::clone(p);
        }
        match &self.config.app.persistence_path {
            Some(path) => Arc::new(JsonlPersistence::new(path)),
            None => Arc::new(InMemoryPersistence::new()),
        }
    }

    pub fn build(self) -> HiveComponents {
        let persistence = self.persistence();
        let cfg = &self.config;

        let registry = Arc::new(
            ServiceRegistry::from_config(&cfg.mcp, Arc::clone(&self.factory), self.cancel.clone())
                .with_health_sink(Arc::new(TracingHealthSink)),
        );
        let agents = AgentRegistry::from_config(&cfg.agents, Arc::clone(&registry));
        let planner = Arc::new(KeywordPlanner::new(cfg.planner.clone()));

        tracing::info!(
            services = ?registry.services(),
            agents = ?agents.names(),
            mock_mode = registry.mock_mode(),
            hitl = cfg.workflow.hitl,
            "Components assembled"
        );

        let orchestrator = Arc::new(
            WorkflowOrchestrator::new(self.store, planner, agents, persistence, self.events)
                .with_default_hitl(cfg.workflow.hitl),
        );
        HiveComponents {
            registry,
            orchestrator,
        }
    }
}
