//! 远程工具调用与 Agent 的错误类型
//!
//! 与 RecoveryEngine 配合：根据 McpError 判断「稍后重试是否有意义」，并生成面向操作员的说明。

use std::fmt;

use thiserror::Error;

/// 连接失败的细分原因（超时 / 其它异常）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorCode {
    Timeout,
    Failed,
}

impl fmt::Display for ConnectErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectErrorCode::Timeout => write!(f, "CONNECTION_TIMEOUT"),
            ConnectErrorCode::Failed => write!(f, "CONNECTION_FAILED"),
        }
    }
}

/// 远程工具服务调用过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// 无法建立（或重建）连接；可在连接层重试
    #[error("Cannot connect to service '{service}' [{code}]: {message}")]
    Connection {
        service: String,
        code: ConnectErrorCode,
        message: String,
    },

    /// 调用超过截止时间；可重试，同时使连接失效
    #[error("Tool '{tool}' on service '{service}' timed out after {timeout_ms}ms")]
    Timeout {
        service: String,
        tool: String,
        timeout_ms: u64,
    },

    /// 未归类为超时的一般调度错误；可重试
    #[error("Tool '{tool}' on service '{service}' failed: {message}")]
    Tool {
        service: String,
        tool: String,
        message: String,
    },

    /// 远程服务明确拒绝了请求（业务错误）；不重试
    #[error("Service '{service}' rejected '{tool}'{suffix}: {message}", suffix = code_suffix(.code))]
    Domain {
        service: String,
        tool: String,
        code: Option<String>,
        message: String,
    },

    /// 所有重试层级都已放弃，携带最后一次底层错误
    #[error("Service '{service}' still failing after {attempts} attempts: {source}")]
    ExhaustedRetries {
        service: String,
        attempts: u32,
        #[source]
        source: Box<McpError>,
    },

    /// 配置中没有该服务的地址
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// 所属作用域已取消（如进程关闭），退避等待被中断
    #[error("Call to service '{0}' cancelled")]
    Cancelled(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl McpError {
    /// 是否值得在本地重试（连接 / 超时 / 一般调度错误）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::Connection { .. } | McpError::Timeout { .. } | McpError::Tool { .. }
        )
    }

    /// 管理层是否应丢弃并重建整个连接
    pub fn invalidates_connection(&self) -> bool {
        matches!(self, McpError::Connection { .. } | McpError::Timeout { .. })
    }

    /// 剥掉 ExhaustedRetries 包装，得到最底层的错误
    pub fn root(&self) -> &McpError {
        match self {
            McpError::ExhaustedRetries { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            McpError::Connection { service, .. }
            | McpError::Timeout { service, .. }
            | McpError::Tool { service, .. }
            | McpError::Domain { service, .. }
            | McpError::ExhaustedRetries { service, .. } => service,
            McpError::UnknownService(service) | McpError::Cancelled(service) => service,
        }
    }
}

/// 专职 Agent / Planner / 持久化等协作方返回的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Agent '{0}' panicked")]
    Panicked(String),
}
