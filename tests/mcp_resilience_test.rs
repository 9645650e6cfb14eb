//! 远程工具调用层集成测试：重试预算、Mock 模式、业务拒绝、JSON-RPC over HTTP

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use hive::core::McpError;
use hive::mcp::{
    HttpTransportFactory, McpTransport, RetryPolicies, RetryPolicy, ServiceEndpoint,
    ServiceRegistry, ToolResponse, TransportError, TransportFactory,
};

fn fast(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
}

fn policies(connect: u32, tool_call: u32, manager: u32) -> RetryPolicies {
    RetryPolicies {
        connect: fast(connect),
        tool_call: fast(tool_call),
        manager: fast(manager),
    }
}

fn endpoint(url: impl Into<String>) -> ServiceEndpoint {
    ServiceEndpoint {
        url: url.into(),
        timeout: Duration::from_millis(500),
    }
}

// ---------- 计数传输 ----------

#[derive(Default)]
struct Counts {
    connects: AtomicU32,
    calls: AtomicU32,
}

struct CountingTransport {
    counts: Arc<Counts>,
    reachable: bool,
    reply: Result<Value, (String, String)>,
}

#[async_trait]
impl McpTransport for CountingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.counts.connects.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            Ok(())
        } else {
            Err(TransportError::Failed("connection refused".into()))
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn call(&self, _tool: &str, _arguments: Value) -> Result<ToolResponse, TransportError> {
        self.counts.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Ok(v) => Ok(ToolResponse::Structured(v.clone())),
            Err((code, message)) => Err(TransportError::Rejected {
                code: Some(code.clone()),
                message: message.clone(),
            }),
        }
    }

    async fn close(&self) {}
}

struct CountingFactory {
    counts: Arc<Counts>,
    reachable: bool,
    reply: Result<Value, (String, String)>,
}

impl CountingFactory {
    fn unreachable() -> Self {
        Self {
            counts: Arc::default(),
            reachable: false,
            reply: Ok(json!({})),
        }
    }

    fn rejecting(code: &str, message: &str) -> Self {
        Self {
            counts: Arc::default(),
            reachable: true,
            reply: Err((code.to_string(), message.to_string())),
        }
    }
}

impl TransportFactory for CountingFactory {
    fn create(&self, _service: &str, _url: &str) -> Result<Arc<dyn McpTransport>, TransportError> {
        Ok(Arc::new(CountingTransport {
            counts: Arc::clone(&self.counts),
            reachable: self.reachable,
            reply: self.reply.clone(),
        }))
    }
}

#[tokio::test]
async fn test_connect_budget_is_exact() {
    let factory = Arc::new(CountingFactory::unreachable());
    let counts = Arc::clone(&factory.counts);
    let registry = ServiceRegistry::new(factory, CancellationToken::new())
        .with_policies(policies(4, 1, 1))
        .with_service("accounts_payable", endpoint("http://127.0.0.1:1/mcp"));

    let err = registry
        .call_tool("accounts_payable", "list_bills", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ExhaustedRetries { .. }));
    assert!(matches!(err.root(), McpError::Connection { .. }));
    assert_eq!(counts.connects.load(Ordering::SeqCst), 4);
    assert_eq!(counts.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_never_falls_back_to_mock() {
    let factory = Arc::new(CountingFactory::unreachable());
    let registry = ServiceRegistry::new(factory, CancellationToken::new())
        .with_policies(policies(2, 2, 2))
        .with_service("gmail", endpoint("http://127.0.0.1:1/mcp"));

    let result = registry.call_tool("gmail", "search_emails", json!({})).await;
    assert!(matches!(result, Err(McpError::ExhaustedRetries { attempts: 2, .. })));
    assert_eq!(registry.mock_calls(), 0);
}

#[tokio::test]
async fn test_mock_mode_ignores_unreachable_service() {
    let factory = Arc::new(CountingFactory::unreachable());
    let counts = Arc::clone(&factory.counts);
    let registry = ServiceRegistry::new(factory, CancellationToken::new())
        .with_mock_mode(true)
        .with_service("accounts_payable", endpoint("http://127.0.0.1:1/mcp"));

    let started = Instant::now();
    let out = registry
        .call_tool("accounts_payable", "list_bills", json!({"invoice_number": "INV-1001"}))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(out["mock_mode"], json!(true));
    assert_eq!(out["service"], json!("accounts_payable"));
    assert_eq!(out["bills"].as_array().map(Vec::len), Some(1));
    assert_eq!(counts.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_domain_rejection_dispatched_once() {
    let factory = Arc::new(CountingFactory::rejecting("BDC_1102", "Bill not found"));
    let counts = Arc::clone(&factory.counts);
    let registry = ServiceRegistry::new(factory, CancellationToken::new())
        .with_policies(policies(3, 3, 3))
        .with_service("accounts_payable", endpoint("http://127.0.0.1:1/mcp"));

    let err = registry
        .call_tool("accounts_payable", "get_bill", json!({"bill_id": "x"}))
        .await
        .unwrap_err();
    match err {
        McpError::Domain { code, message, .. } => {
            assert_eq!(code.as_deref(), Some("BDC_1102"));
            assert_eq!(message, "Bill not found");
        }
        other => panic!("expected Domain, got {other:?}"),
    }
    assert_eq!(counts.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_backoff_is_bounded_and_non_decreasing() {
    let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1_000));
    let seq: Vec<_> = (0..8).map(|k| policy.backoff(k)).collect();
    assert_eq!(seq[0], Duration::from_millis(100));
    assert_eq!(seq[3], Duration::from_millis(800));
    for w in seq.windows(2) {
        assert!(w[0] <= w[1]);
        if w[0] < Duration::from_millis(1_000) {
            assert!(w[0] < w[1]);
        }
    }
    assert!(seq[4..].iter().all(|d| *d == Duration::from_millis(1_000)));
}

// ---------- JSON-RPC over HTTP ----------

/// 记录 (method, session header)
type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

async fn read_request(stream: &mut TcpStream) -> Option<(String, Value)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length")
                .then(|| v.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);
    Some((head, body))
}

fn session_of(head: &str) -> Option<String> {
    head.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        k.eq_ignore_ascii_case("mcp-session-id").then(|| v.trim().to_string())
    })
}

async fn respond(stream: &mut TcpStream, status: &str, extra: &str, body: &str) {
    let resp = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra}\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn handle_conn(mut stream: TcpStream, seen: Seen) {
    let Some((head, body)) = read_request(&mut stream).await else {
        return;
    };
    let method = body["method"].as_str().unwrap_or("").to_string();
    seen.lock().unwrap().push((method.clone(), session_of(&head)));
    let id = body["id"].clone();

    let reply = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
    match method.as_str() {
        "initialize" => {
            let body = reply(json!({"protocolVersion": "2025-03-26", "capabilities": {}}));
            respond(&mut stream, "200 OK", "Mcp-Session-Id: sess-42\r\n", &body).await;
        }
        "notifications/initialized" => respond(&mut stream, "202 Accepted", "", "").await,
        "ping" => respond(&mut stream, "200 OK", "", &reply(json!({}))).await,
        "tools/call" => {
            let body = match body["params"]["name"].as_str() {
                Some("list_bills") => reply(json!({
                    "structuredContent": {"bills": [{"invoice_number": "INV-1001"}]},
                    "content": [{"type": "text", "text": "1 bill"}],
                })),
                Some("get_bill") => reply(json!({
                    "isError": true,
                    "content": [{"type": "text", "text": "Bill not found"}],
                })),
                _ => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": "BDC_1144", "message": "Bill already approved"},
                })
                .to_string(),
            };
            respond(&mut stream, "200 OK", "", &body).await;
        }
        _ => respond(&mut stream, "404 Not Found", "", "").await,
    }
}

async fn spawn_stub() -> (String, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::default();
    let seen_srv = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_conn(stream, Arc::clone(&seen_srv)));
        }
    });
    (format!("http://{addr}/mcp"), seen)
}

fn http_registry(url: &str) -> ServiceRegistry {
    ServiceRegistry::new(Arc::new(HttpTransportFactory::default()), CancellationToken::new())
        .with_policies(policies(2, 2, 2))
        .with_service("accounts_payable", endpoint(url))
}

fn calls_to(seen: &Seen, method: &str) -> usize {
    seen.lock().unwrap().iter().filter(|(m, _)| m == method).count()
}

#[tokio::test]
async fn test_http_session_and_structured_result() {
    let (url, seen) = spawn_stub().await;
    let registry = http_registry(&url);

    let out = registry
        .call_tool("accounts_payable", "list_bills", json!({"query": "INV-1001"}))
        .await
        .unwrap();
    assert_eq!(out["bills"][0]["invoice_number"], json!("INV-1001"));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0], ("initialize".to_string(), None));
    let call = seen.iter().find(|(m, _)| m == "tools/call").unwrap();
    assert_eq!(call.1.as_deref(), Some("sess-42"));
}

#[tokio::test]
async fn test_http_is_error_result_is_domain_failure() {
    let (url, seen) = spawn_stub().await;
    let registry = http_registry(&url);

    let err = registry
        .call_tool("accounts_payable", "get_bill", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Domain { ref message, .. } if message == "Bill not found"));
    assert_eq!(calls_to(&seen, "tools/call"), 1);
}

#[tokio::test]
async fn test_http_json_rpc_error_is_domain_failure() {
    let (url, seen) = spawn_stub().await;
    let registry = http_registry(&url);

    let err = registry
        .call_tool("accounts_payable", "approve_bill", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Domain { ref code, .. } if code.as_deref() == Some("BDC_1144")));
    assert_eq!(calls_to(&seen, "tools/call"), 1);

    let report = registry.health("accounts_payable").await;
    assert!(report.healthy);
    assert!(!report.mock_mode);
}

#[tokio::test]
async fn test_http_closed_port_exhausts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = http_registry(&format!("http://{addr}/mcp"));
    let err = registry
        .call_tool("accounts_payable", "list_bills", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::ExhaustedRetries { attempts: 2, .. }));
    assert!(matches!(err.root(), McpError::Connection { .. }));
}
