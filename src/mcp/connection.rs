//! 单个远程工具服务的连接句柄
//!
//! 负责连接生命周期（建立 / 探活 / 断开）与计数器。句柄在所有工作流之间共享：
//! 任一调用触发的断开或重连对所有使用者可见，计数器也是聚合值而非按调用方区分。
//!
//! 状态约束：只有最近一次连接尝试成功时才是 Connected；调用失败会把句柄打回 Disconnected，
//! 下次使用时强制重连。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{ConnectErrorCode, McpError};
use crate::mcp::retry::{backoff_sleep, RetryPolicy};
use crate::mcp::transport::{McpTransport, TransportError};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// 已连接但最近的健康检查失败
    Degraded,
}

#[derive(Debug, Default)]
struct Counters {
    tool_calls: AtomicU64,
    errors: AtomicU64,
    connect_attempts: AtomicU64,
    consecutive_timeouts: AtomicU32,
    consecutive_health_failures: AtomicU32,
}

#[derive(Debug)]
struct HandleState {
    status: ConnectionStatus,
    last_health_check: Option<DateTime<Utc>>,
    connect_latency: Option<Duration>,
}

/// 句柄快照（用于诊断与健康汇总）
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub service: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub tool_calls: u64,
    pub errors: u64,
    pub connect_attempts: u64,
    pub consecutive_timeouts: u32,
    pub consecutive_health_failures: u32,
    pub last_health_check: Option<String>,
    pub connect_latency_ms: Option<u64>,
}

/// 单个服务的健康报告
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub tool_count: u64,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mock_mode: bool,
}

/// 连接句柄：一个服务一条逻辑连接
pub struct ConnectionHandle {
    service: String,
    url: String,
    timeout: Duration,
    transport: Arc<dyn McpTransport>,
    connect_policy: RetryPolicy,
    max_health_failures: u32,
    state: RwLock<HandleState>,
    /// 串行化并发的连接尝试
    connect_lock: Mutex<()>,
    counters: Counters,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        service: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        transport: Arc<dyn McpTransport>,
        connect_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service: service.into(),
            url: url.into(),
            timeout,
            transport,
            connect_policy,
            max_health_failures: 3,
            state: RwLock::new(HandleState {
                status: ConnectionStatus::Disconnected,
                last_health_check: None,
                connect_latency: None,
            }),
            connect_lock: Mutex::new(()),
            counters: Counters::default(),
            cancel,
        }
    }

    pub fn with_max_health_failures(mut self, n: u32) -> Self {
        self.max_health_failures = n.max(1);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> &Arc<dyn McpTransport> {
        &self.transport
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    /// 可直接派发调用：Connected，或探活失败但链路仍在的 Degraded
    pub async fn is_connected(&self) -> bool {
        matches!(
            self.status().await,
            ConnectionStatus::Connected | ConnectionStatus::Degraded
        )
    }

    async fn set_status(&self, status: ConnectionStatus) {
        self.state.write().await.status = status;
    }

    /// 调用失败后打回 Disconnected，下次使用时重连
    pub async fn mark_disconnected(&self) {
        self.set_status(ConnectionStatus::Disconnected).await;
    }

    pub(crate) fn record_tool_success(&self) {
        self.counters.tool_calls.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tool_calls(&self) -> u64 {
        self.counters.tool_calls.load(Ordering::Relaxed)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.counters.connect_attempts.load(Ordering::Relaxed)
    }

    /// 建立连接：按连接层策略重试；成功后做一次健康探测
    pub async fn connect(&self) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        let policy = &self.connect_policy;
        let mut last = (ConnectErrorCode::Failed, String::from("no attempt made"));
        for attempt in 0..policy.max_attempts {
            self.set_status(ConnectionStatus::Connecting).await;
            self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();

            let outcome = match timeout(self.timeout, self.transport.connect()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(TransportError::Timeout)) | Err(_) => Err((
                    ConnectErrorCode::Timeout,
                    format!("no answer within {:?}", self.timeout),
                )),
                Ok(Err(e)) => Err((ConnectErrorCode::Failed, e.to_string())),
            };

            match outcome {
                Ok(()) => {
                    let latency = started.elapsed();
                    {
                        let mut state = self.state.write().await;
                        state.status = ConnectionStatus::Connected;
                        state.connect_latency = Some(latency);
                    }
                    tracing::info!(
                        service = %self.service,
                        attempt = attempt + 1,
                        latency_ms = latency.as_millis() as u64,
                        "Connected to tool service"
                    );
                    if let Err(e) = self.probe(false).await {
                        tracing::warn!(service = %self.service, "Post-connect health probe failed: {}", e);
                    }
                    return Ok(());
                }
                Err((code, message)) => {
                    self.set_status(ConnectionStatus::Disconnected).await;
                    tracing::warn!(
                        service = %self.service,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        %code,
                        "Connect attempt failed: {}",
                        message
                    );
                    last = (code, message);
                }
            }

            if policy.has_next(attempt)
                && backoff_sleep(policy, attempt, &self.cancel).await.is_err()
            {
                return Err(McpError::Cancelled(self.service.clone()));
            }
        }

        Err(McpError::Connection {
            service: self.service.clone(),
            code: last.0,
            message: last.1,
        })
    }

    /// 探活一次：记录时间与延迟，维护连续失败计数；degrade 为 false 时不改变连接状态
    async fn probe(&self, degrade: bool) -> Result<Duration, String> {
        let started = Instant::now();
        let outcome = match timeout(self.timeout, self.transport.ping()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ping timed out after {:?}", self.timeout)),
        };

        let mut state = self.state.write().await;
        state.last_health_check = Some(Utc::now());
        match &outcome {
            Ok(_) => {
                self.counters.consecutive_health_failures.store(0, Ordering::Relaxed);
                if state.status == ConnectionStatus::Degraded {
                    state.status = ConnectionStatus::Connected;
                }
            }
            Err(_) if !degrade => {
                self.counters
                    .consecutive_health_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let failures = self
                    .counters
                    .consecutive_health_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if failures >= self.max_health_failures {
                    state.status = ConnectionStatus::Disconnected;
                } else if state.status == ConnectionStatus::Connected {
                    state.status = ConnectionStatus::Degraded;
                }
            }
        }
        outcome
    }

    /// 健康检查：未连接时先连接，再探活
    pub async fn health_check(&self) -> HealthReport {
        if self.status().await == ConnectionStatus::Disconnected {
            if let Err(e) = self.connect().await {
                return self.report(false, None, Some(e.to_string()));
            }
        }
        match self.probe(true).await {
            Ok(latency) => self.report(true, Some(latency), None),
            Err(e) => self.report(false, None, Some(e)),
        }
    }

    fn report(&self, healthy: bool, latency: Option<Duration>, error: Option<String>) -> HealthReport {
        HealthReport {
            service: self.service.clone(),
            healthy,
            latency_ms: latency.map(|d| d.as_millis() as u64),
            tool_count: self.tool_calls(),
            error,
            mock_mode: false,
        }
    }

    pub async fn disconnect(&self) {
        self.transport.close().await;
        self.mark_disconnected().await;
        tracing::info!(service = %self.service, "Disconnected from tool service");
    }

    pub async fn stats(&self) -> ConnectionStats {
        let state = self.state.read().await;
        ConnectionStats {
            service: self.service.clone(),
            url: self.url.clone(),
            status: state.status,
            tool_calls: self.tool_calls(),
            errors: self.counters.errors.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts(),
            consecutive_timeouts: self.counters.consecutive_timeouts.load(Ordering::Relaxed),
            consecutive_health_failures: self
                .counters
                .consecutive_health_failures
                .load(Ordering::Relaxed),
            last_health_check: state
                .last_health_check
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            connect_latency_ms: state.connect_latency.map(|d| d.as_millis() as u64),
        }
    }
}
