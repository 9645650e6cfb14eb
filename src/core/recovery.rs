//! 错误恢复建议
//!
//! 根据 McpError 类型返回 RecoveryAdvice，供编排器生成面向操作员的失败说明：
//! 服务不可达（稍后重试可能有用）与服务拒绝请求（重试无济于事）必须能一眼区分。

use crate::core::McpError;

/// 面向人的恢复建议
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAdvice {
    /// 稍后重试是否可能成功
    pub retry_later: bool,
    /// 可直接展示给操作员的说明
    pub message: String,
}

/// 语义化错误分类：将错误映射为「可重试 / 不可重试」与说明文字
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn advise(&self, err: &McpError) -> RecoveryAdvice {
        match err {
            McpError::ExhaustedRetries {
                service,
                attempts,
                source,
            } => {
                let inner = self.advise(source);
                RecoveryAdvice {
                    retry_later: inner.retry_later,
                    message: format!(
                        "{} (gave up after {attempts} attempts against '{service}')",
                        inner.message
                    ),
                }
            }
            McpError::Connection { service, code, .. } => RecoveryAdvice {
                retry_later: true,
                message: format!(
                    "The remote service '{service}' is unreachable ({code}). Retrying later may succeed."
                ),
            },
            McpError::Timeout {
                service,
                tool,
                timeout_ms,
            } => RecoveryAdvice {
                retry_later: true,
                message: format!(
                    "The remote service '{service}' did not answer '{tool}' within {timeout_ms}ms. Retrying later may succeed."
                ),
            },
            McpError::Tool {
                service, message, ..
            } => RecoveryAdvice {
                retry_later: true,
                message: format!(
                    "The remote service '{service}' failed to process the call ({message}). Retrying later may succeed."
                ),
            },
            McpError::Domain {
                service,
                code,
                message,
                ..
            } => RecoveryAdvice {
                retry_later: false,
                message: match code {
                    Some(code) => format!(
                        "The remote service '{service}' rejected the request [{code}]: {message}. Retrying will not help; change the request."
                    ),
                    None => format!(
                        "The remote service '{service}' rejected the request: {message}. Retrying will not help; change the request."
                    ),
                },
            },
            McpError::UnknownService(service) => RecoveryAdvice {
                retry_later: false,
                message: format!(
                    "No endpoint is configured for service '{service}'. Fix the configuration before retrying."
                ),
            },
            McpError::Cancelled(service) => RecoveryAdvice {
                retry_later: true,
                message: format!("The call to '{service}' was cancelled because the process is shutting down."),
            },
        }
    }
}
