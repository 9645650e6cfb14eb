//! 带重试的工具调用器
//!
//! 包装 ConnectionHandle，对单次工具调用施加「单次调用层」的重试与退避：
//! - 只处理真实调用；Mock 开关由 ServiceRegistry 在创建句柄之前统一判断
//! - 未连接时先连接；连接失败只算本次尝试失败，继续重试循环
//! - 超时 / 一般调度错误：打回 Disconnected 后重试，用尽后抛出 Timeout / Tool
//! - 业务拒绝（HTTP 200 + 错误负载）立即抛出，不重试
//!
//! 每次调用输出一行结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::McpError;
use crate::mcp::connection::ConnectionHandle;
use crate::mcp::retry::{backoff_sleep, RetryPolicy};
use crate::mcp::transport::{detect_domain_error, normalize_response, ToolResult, TransportError};

pub struct RetryingInvoker {
    handle: Arc<ConnectionHandle>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingInvoker {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle,
            policy,
            cancel,
        }
    }

    pub async fn call_tool(&self, tool: &str, args: Value) -> Result<ToolResult, McpError> {
        let started = Instant::now();
        let preview = args_preview(&args);
        let (result, attempts) = self.dispatch_with_retry(tool, args).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(McpError::Domain { .. }) => "rejected",
            Err(McpError::Timeout { .. }) => "timeout",
            Err(McpError::Connection { .. }) => "unreachable",
            Err(McpError::Cancelled(_)) => "cancelled",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "mcp_call_audit",
            "service": self.handle.service(),
            "tool": tool,
            "ok": result.is_ok(),
            "outcome": outcome,
            "attempts": attempts,
            "duration_ms": started.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "mcp");
        result
    }

    /// 返回结果与实际发起的尝试次数
    async fn dispatch_with_retry(&self, tool: &str, args: Value) -> (Result<ToolResult, McpError>, u32) {
        let handle = &self.handle;
        let service = handle.service().to_string();
        let mut last: Option<McpError> = None;
        let mut attempts = 0;

        for attempt in 0..self.policy.max_attempts {
            attempts = attempt + 1;

            if !handle.is_connected().await {
                if let Err(e) = handle.connect().await {
                    if matches!(e, McpError::Cancelled(_)) {
                        return (Err(e), attempts);
                    }
                    tracing::warn!(service = %service, tool, attempt = attempts, "Connect failed before dispatch: {}", e);
                    last = Some(e);
                    if let Err(e) = self.pause(attempt).await {
                        return (Err(e), attempts);
                    }
                    continue;
                }
            }

            match timeout(handle.timeout(), handle.transport().call(tool, args.clone())).await {
                Ok(Ok(response)) => {
                    let result = normalize_response(response);
                    if let Some(rejection) = detect_domain_error(&result) {
                        handle.record_error();
                        return (
                            Err(McpError::Domain {
                                service,
                                tool: tool.to_string(),
                                code: rejection.code,
                                message: rejection.message,
                            }),
                            attempts,
                        );
                    }
                    handle.record_tool_success();
                    return (Ok(result), attempts);
                }
                Ok(Err(TransportError::Rejected { code, message })) => {
                    handle.record_error();
                    return (
                        Err(McpError::Domain {
                            service,
                            tool: tool.to_string(),
                            code,
                            message,
                        }),
                        attempts,
                    );
                }
                Ok(Err(TransportError::Timeout)) | Err(_) => {
                    handle.record_timeout();
                    handle.mark_disconnected().await;
                    tracing::warn!(service = %service, tool, attempt = attempts, "Tool call timed out");
                    last = Some(McpError::Timeout {
                        service: service.clone(),
                        tool: tool.to_string(),
                        timeout_ms: handle.timeout().as_millis() as u64,
                    });
                }
                Ok(Err(TransportError::Failed(message))) => {
                    handle.record_error();
                    handle.mark_disconnected().await;
                    tracing::warn!(service = %service, tool, attempt = attempts, "Tool call failed: {}", message);
                    last = Some(McpError::Tool {
                        service: service.clone(),
                        tool: tool.to_string(),
                        message,
                    });
                }
            }

            if let Err(e) = self.pause(attempt).await {
                return (Err(e), attempts);
            }
        }

        let err = last.unwrap_or_else(|| McpError::Tool {
            service,
            tool: tool.to_string(),
            message: "no attempt made".to_string(),
        });
        (Err(err), attempts)
    }

    /// 两次尝试之间的退避；最后一次之后不等待
    async fn pause(&self, attempt: u32) -> Result<(), McpError> {
        if !self.policy.has_next(attempt) {
            return Ok(());
        }
        backoff_sleep(&self.policy, attempt, &self.cancel)
            .await
            .map_err(|_| McpError::Cancelled(self.handle.service().to_string()))
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
