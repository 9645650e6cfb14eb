//! 服务注册表
//!
//! 服务名 → ConnectionHandle，首次使用时惰性创建并在之后复用。
//! call_tool 在 RetryingInvoker 之外再套一层「管理层」重试：遇到连接 / 超时错误时
//! 丢弃整个句柄并重建后重试；用尽后以 ExhaustedRetries 抛给调用方。
//! health_all 并发探测所有已配置服务，单个服务的失败不影响其它服务。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::McpSection;
use crate::core::{ConnectErrorCode, McpError};
use crate::mcp::connection::{ConnectionHandle, ConnectionStats, HealthReport};
use crate::mcp::invoker::RetryingInvoker;
use crate::mcp::mock::mock_response;
use crate::mcp::retry::{backoff_sleep, RetryPolicies};
use crate::mcp::transport::{ToolResult, TransportFactory};
use crate::observability::HealthSink;

/// 一个远程工具服务的地址与超时
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub url: String,
    pub timeout: Duration,
}

/// 服务注册表：持有所有连接句柄（进程内共享）
pub struct ServiceRegistry {
    endpoints: BTreeMap<String, ServiceEndpoint>,
    handles: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    factory: Arc<dyn TransportFactory>,
    policies: RetryPolicies,
    mock_mode: bool,
    max_health_failures: u32,
    cancel: CancellationToken,
    mock_calls: AtomicU64,
    health_sink: Option<Arc<dyn HealthSink>>,
}

impl ServiceRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, cancel: CancellationToken) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            handles: RwLock::new(HashMap::new()),
            factory,
            policies: RetryPolicies::default(),
            mock_mode: false,
            max_health_failures: 3,
            cancel,
            mock_calls: AtomicU64::new(0),
            health_sink: None,
        }
    }

    /// 按 [mcp] 配置段构建
    pub fn from_config(
        cfg: &McpSection,
        factory: Arc<dyn TransportFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let mut registry = Self::new(factory, cancel)
            .with_mock_mode(cfg.mock_mode)
            .with_policies(cfg.retry.to_policies())
            .with_max_health_failures(cfg.max_health_failures);
        for (name, svc) in &cfg.services {
            registry = registry.with_service(
                name.clone(),
                ServiceEndpoint {
                    url: svc.url.clone(),
                    timeout: Duration::from_secs(svc.timeout_secs.unwrap_or(cfg.default_timeout_secs)),
                },
            );
        }
        registry
    }

    pub fn with_service(mut self, name: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn with_mock_mode(mut self, enabled: bool) -> Self {
        self.mock_mode = enabled;
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_max_health_failures(mut self, n: u32) -> Self {
        self.max_health_failures = n;
        self
    }

    pub fn with_health_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.health_sink = Some(sink);
        self
    }

    pub fn mock_mode(&self) -> bool {
        self.mock_mode
    }

    pub fn mock_calls(&self) -> u64 {
        self.mock_calls.load(Ordering::Relaxed)
    }

    /// 已配置的服务名（有序）
    pub fn services(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    /// 取已有句柄，没有则创建
    async fn handle(&self, service: &str) -> Result<Arc<ConnectionHandle>, McpError> {
        if let Some(h) = self.handles.read().await.get(service) {
            return Ok(Arc::clone(h));
        }

        let endpoint = self
            .endpoints
            .get(service)
            .ok_or_else(|| McpError::UnknownService(service.to_string()))?;

        let mut handles = self.handles.write().await;
        if let Some(h) = handles.get(service) {
            return Ok(Arc::clone(h));
        }
        let transport = self
            .factory
            .create(service, &endpoint.url)
            .map_err(|e| McpError::Connection {
                service: service.to_string(),
                code: ConnectErrorCode::Failed,
                message: e.to_string(),
            })?;
        let handle = Arc::new(
            ConnectionHandle::new(
                service,
                endpoint.url.clone(),
                endpoint.timeout,
                transport,
                self.policies.connect.clone(),
                self.cancel.child_token(),
            )
            .with_max_health_failures(self.max_health_failures),
        );
        handles.insert(service.to_string(), Arc::clone(&handle));
        tracing::debug!(service, url = %endpoint.url, "Created connection handle");
        Ok(handle)
    }

    /// 丢弃句柄（只在表中仍是同一个句柄时移除，避免误删其它调用刚重建的句柄）
    async fn discard(&self, service: &str, handle: &Arc<ConnectionHandle>) {
        let removed = {
            let mut handles = self.handles.write().await;
            match handles.get(service) {
                Some(current) if Arc::ptr_eq(current, handle) => handles.remove(service),
                _ => None,
            }
        };
        if let Some(old) = removed {
            old.disconnect().await;
            tracing::info!(service, "Discarded connection handle for recreation");
        }
    }

    /// 调用服务上的工具，返回归一化结果
    ///
    /// Mock 开关只在这里判断一次：打开时不创建句柄、不触网，计数记在 mock_calls。
    pub async fn call_tool(&self, service: &str, tool: &str, args: Value) -> Result<ToolResult, McpError> {
        if self.mock_mode {
            self.mock_calls.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(service, tool, "Mock mode call");
            return Ok(mock_response(service, tool, &args));
        }

        let policy = &self.policies.manager;
        let mut last: Option<McpError> = None;

        for attempt in 0..policy.max_attempts {
            let handle = match self.handle(service).await {
                Ok(h) => h,
                Err(e @ McpError::UnknownService(_)) => return Err(e),
                Err(e) => {
                    last = Some(e);
                    self.pause(service, attempt).await?;
                    continue;
                }
            };

            let invoker = RetryingInvoker::new(
                Arc::clone(&handle),
                self.policies.tool_call.clone(),
                self.cancel.child_token(),
            );
            match invoker.call_tool(tool, args.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.invalidates_connection() => {
                    tracing::warn!(
                        service,
                        tool,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        "Recreating connection after: {}",
                        e
                    );
                    self.discard(service, &handle).await;
                    last = Some(e);
                }
                Err(e @ McpError::Tool { .. }) => {
                    return Err(McpError::ExhaustedRetries {
                        service: service.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }

            self.pause(service, attempt).await?;
        }

        let source = last.unwrap_or_else(|| McpError::Connection {
            service: service.to_string(),
            code: ConnectErrorCode::Failed,
            message: "no attempt made".to_string(),
        });
        Err(McpError::ExhaustedRetries {
            service: service.to_string(),
            attempts: policy.max_attempts,
            source: Box::new(source),
        })
    }

    async fn pause(&self, service: &str, attempt: u32) -> Result<(), McpError> {
        let policy = &self.policies.manager;
        if !policy.has_next(attempt) {
            return Ok(());
        }
        backoff_sleep(policy, attempt, &self.cancel)
            .await
            .map_err(|_| McpError::Cancelled(service.to_string()))
    }

    /// 探测单个服务
    pub async fn health(&self, service: &str) -> HealthReport {
        let report = if self.mock_mode {
            HealthReport {
                service: service.to_string(),
                healthy: true,
                latency_ms: Some(0),
                tool_count: self.mock_calls(),
                error: None,
                mock_mode: true,
            }
        } else {
            match self.handle(service).await {
                Ok(handle) => handle.health_check().await,
                Err(e) => HealthReport {
                    service: service.to_string(),
                    healthy: false,
                    latency_ms: None,
                    tool_count: 0,
                    error: Some(e.to_string()),
                    mock_mode: false,
                },
            }
        };
        if let Some(sink) = &self.health_sink {
            sink.report(&report);
        }
        report
    }

    /// 并发探测所有已配置服务
    pub async fn health_all(&self) -> Vec<HealthReport> {
        let services = self.services();
        join_all(services.iter().map(|s| self.health(s))).await
    }

    pub async fn stats(&self, service: &str) -> Option<ConnectionStats> {
        let handle = self.handles.read().await.get(service).cloned()?;
        Some(handle.stats().await)
    }

    /// 取消所有退避等待并断开全部连接
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.write().await.drain().map(|(_, h)| h).collect();
        join_all(handles.iter().map(|h| h.disconnect())).await;
        tracing::info!(count = handles.len(), "Service registry shut down");
    }
}
