//! 传输边界：远程工具服务的 JSON-RPC over HTTP 客户端与响应归一化
//!
//! 传输层把各种原生信封收敛成封闭的 ToolResponse 变体，下游只做模式匹配：
//! - `structuredContent` → Structured
//! - `data` → Data
//! - 文本内容块 → Text
//! - 其它 JSON → Raw
//!
//! normalize_response 再把变体统一成 `Map<String, Value>`。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

/// 归一化后的工具结果
pub type ToolResult = Map<String, Value>;

/// 传输边界产出的响应变体
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResponse {
    Structured(Value),
    Data(Value),
    Raw(Value),
    Text(String),
}

/// 文本解析为结构化数据失败
#[derive(Debug, Error, PartialEq)]
pub enum ParseFailure {
    #[error("invalid JSON: {0}")]
    Invalid(String),
    #[error("JSON is not an object")]
    NotAnObject,
}

/// 尝试把纯文本解析为 JSON 对象
pub fn parse_structured(text: &str) -> Result<ToolResult, ParseFailure> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ParseFailure::NotAnObject),
        Err(e) => Err(ParseFailure::Invalid(e.to_string())),
    }
}

fn wrap_result(value: Value) -> ToolResult {
    let mut map = Map::new();
    map.insert("result".to_string(), value);
    map
}

/// 将任意响应变体归一化为结果字典
pub fn normalize_response(response: ToolResponse) -> ToolResult {
    match response {
        ToolResponse::Structured(Value::Object(map))
        | ToolResponse::Data(Value::Object(map))
        | ToolResponse::Raw(Value::Object(map)) => map,
        ToolResponse::Structured(other) | ToolResponse::Data(other) => wrap_result(other),
        ToolResponse::Raw(Value::String(text)) | ToolResponse::Text(text) => {
            match parse_structured(&text) {
                Ok(map) => map,
                Err(_) => wrap_result(Value::String(text)),
            }
        }
        ToolResponse::Raw(other) => wrap_result(Value::String(other.to_string())),
    }
}

/// 结果中内嵌的业务拒绝（HTTP 200 但负载表示错误）
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRejection {
    pub code: Option<String>,
    pub message: String,
}

fn value_to_code(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// 检查归一化结果里是否内嵌了业务错误
///
/// 识别 `isError: true`，以及非空的 `error` 字段（字符串或带 code/message 的对象）。
pub fn detect_domain_error(result: &ToolResult) -> Option<DomainRejection> {
    match result.get("error") {
        Some(Value::String(message)) => {
            return Some(DomainRejection {
                code: result.get("error_code").and_then(value_to_code),
                message: message.clone(),
            })
        }
        Some(Value::Object(err)) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| Value::Object(err.clone()).to_string());
            return Some(DomainRejection {
                code: err.get("code").and_then(value_to_code),
                message,
            });
        }
        _ => {}
    }

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = result
            .get("message")
            .or_else(|| result.get("result"))
            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
            .unwrap_or_else(|| "tool reported an error".to_string());
        return Some(DomainRejection { code: None, message });
    }

    None
}

/// 传输层错误（尚未带上服务 / 工具上下文）
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
    /// 服务端正常应答，但负载是错误（JSON-RPC error 或 isError 结果）
    #[error("rejected: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },
}

/// 单个远程工具服务的传输：握手、探活、调用、关闭
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;

    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolResponse, TransportError>;

    async fn close(&self);
}

/// 为服务创建传输（仅构造，不做网络 I/O）
pub trait TransportFactory: Send + Sync {
    fn create(&self, service: &str, url: &str) -> Result<Arc<dyn McpTransport>, TransportError>;
}

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC 2.0 over HTTP 的传输实现
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(session) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }
        let resp = req.send().await.map_err(map_reqwest_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Failed(format!("HTTP {}", resp.status())));
        }
        Ok(resp)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .post(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = resp.text().await.map_err(map_reqwest_error)?;
        let envelope = if is_sse {
            last_sse_payload(&text)
                .ok_or_else(|| TransportError::Failed("empty event stream".to_string()))?
        } else {
            serde_json::from_str::<Value>(&text)
                .map_err(|e| TransportError::Failed(format!("invalid JSON-RPC body: {e}")))?
        };

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(TransportError::Rejected {
                code: err.get("code").and_then(value_to_code),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown JSON-RPC error")
                    .to_string(),
            });
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Failed(e.to_string())
    }
}

/// 从 SSE 文本中取最后一个 data: JSON 负载
fn last_sse_payload(text: &str) -> Option<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .last()
}

/// 将 tools/call 的 result 映射为 ToolResponse
pub fn classify_call_result(result: Value) -> Result<ToolResponse, TransportError> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(TransportError::Rejected {
            code: None,
            message: content_text(&result).unwrap_or_else(|| "tool reported an error".to_string()),
        });
    }
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(ToolResponse::Structured(structured.clone()));
    }
    if let Some(data) = result.get("data").filter(|v| !v.is_null()) {
        return Ok(ToolResponse::Data(data.clone()));
    }
    if let Some(text) = content_text(&result) {
        return Ok(ToolResponse::Text(text));
    }
    Ok(ToolResponse::Raw(result))
}

/// 拼接 content 数组中的文本块
fn content_text(result: &Value) -> Option<String> {
    let items = result.get("content")?.as_array()?;
    let texts: Vec<&str> = items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "hive", "version": env!("CARGO_PKG_VERSION") },
            }),
        )
        .await?;
        // 通知没有响应体，失败不影响握手结果
        if let Err(e) = self
            .post(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await
        {
            tracing::debug!(url = %self.url, "initialized notification failed: {}", e);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.rpc("ping", json!({})).await.map(|_| ())
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolResponse, TransportError> {
        let result = self
            .rpc("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await?;
        classify_call_result(result)
    }

    async fn close(&self) {
        let Some(session) = self.session_id.write().await.take() else {
            return;
        };
        let _ = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await;
    }
}

/// 共享同一个 reqwest::Client 的 HttpTransport 工厂
#[derive(Clone, Default)]
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, _service: &str, url: &str) -> Result<Arc<dyn McpTransport>, TransportError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TransportError::Failed(format!("unsupported endpoint url: {url}")));
        }
        Ok(Arc::new(HttpTransport::new(self.client.clone(), url)))
    }
}
