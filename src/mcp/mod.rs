//! 远程工具服务（MCP）调用层
//!
//! 三层重试：连接层（ConnectionHandle::connect）、单次调用层（RetryingInvoker）、
//! 管理层（ServiceRegistry::call_tool，必要时丢弃并重建句柄）。

pub mod connection;
pub mod invoker;
pub mod mock;
pub mod registry;
pub mod retry;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionStats, ConnectionStatus, HealthReport};
pub use invoker::RetryingInvoker;
pub use mock::mock_response;
pub use registry::{ServiceEndpoint, ServiceRegistry};
pub use retry::{backoff_sleep, RetryPolicies, RetryPolicy};
pub use transport::{
    detect_domain_error, normalize_response, parse_structured, HttpTransport, HttpTransportFactory,
    McpTransport, ParseFailure, ToolResponse, ToolResult, TransportError, TransportFactory,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{McpTransport, RetryPolicy, ToolResponse, TransportError, TransportFactory};

    pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    /// 一次 call 的脚本化结果
    #[derive(Debug, Clone)]
    pub enum Step {
        Ok(ToolResponse),
        Fail(String),
        Reject { code: String, message: String },
        /// 永不返回（由调用方超时截断）
        Hang,
    }

    impl Step {
        pub fn ok_json(value: Value) -> Self {
            Step::Ok(ToolResponse::Structured(value))
        }

        pub fn reject(code: &str, message: &str) -> Self {
            Step::Reject {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
    }

    /// 按脚本逐次返回结果的传输；脚本用完后使用 fallback
    pub struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        fallback: Option<Step>,
        connect_ok: AtomicBool,
        pub calls: AtomicU32,
        pub connects: AtomicU32,
    }

    impl ScriptedTransport {
        pub fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                fallback: None,
                connect_ok: AtomicBool::new(true),
                calls: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            })
        }

        pub fn with_fallback(steps: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                fallback: Some(fallback),
                connect_ok: AtomicBool::new(true),
                calls: AtomicU32::new(0),
                connects: AtomicU32::new(0),
            })
        }

        pub fn healthy() -> Arc<Self> {
            Self::with_fallback(vec![], Step::ok_json(serde_json::json!({})))
        }

        /// 连接永远被拒绝
        pub fn unreachable() -> Arc<Self> {
            let t = Self::new(vec![]);
            t.connect_ok.store(false, Ordering::SeqCst);
            t
        }

        fn next_step(&self) -> Step {
            let mut steps = self.steps.lock().unwrap();
            steps
                .pop_front()
                .or_else(|| self.fallback.clone())
                .unwrap_or_else(|| Step::Fail("script exhausted".into()))
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Failed("connection refused".into()))
            }
        }

        async fn ping(&self) -> Result<(), TransportError> {
            if self.connect_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Failed("connection refused".into()))
            }
        }

        async fn call(&self, _tool: &str, _arguments: Value) -> Result<ToolResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.next_step() {
                Step::Ok(resp) => Ok(resp),
                Step::Fail(msg) => Err(TransportError::Failed(msg)),
                Step::Reject { code, message } => Err(TransportError::Rejected {
                    code: Some(code),
                    message,
                }),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(TransportError::Timeout)
                }
            }
        }

        async fn close(&self) {}
    }

    type Builder = Box<dyn Fn(&str) -> Arc<ScriptedTransport> + Send + Sync>;

    /// 记录创建过的所有传输，便于跨句柄统计
    pub struct ScriptedFactory {
        build: Builder,
        sequence: Mutex<VecDeque<Arc<ScriptedTransport>>>,
        made: Mutex<Vec<Arc<ScriptedTransport>>>,
        pub created: AtomicU32,
    }

    impl ScriptedFactory {
        pub fn new<F>(build: F) -> Arc<Self>
        where
            F: Fn(&str) -> Arc<ScriptedTransport> + Send + Sync + 'static,
        {
            Arc::new(Self {
                build: Box::new(build),
                sequence: Mutex::new(VecDeque::new()),
                made: Mutex::new(Vec::new()),
                created: AtomicU32::new(0),
            })
        }

        /// 依次返回给定传输，用完后退化为不可达
        pub fn sequence(transports: Vec<Arc<ScriptedTransport>>) -> Arc<Self> {
            let factory = Self::new(|_| ScriptedTransport::unreachable());
            *factory.sequence.lock().unwrap() = transports.into();
            factory
        }

        pub fn total_connects(&self) -> u32 {
            self.made
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.connects.load(Ordering::SeqCst))
                .sum()
        }

        pub fn total_calls(&self) -> u32 {
            self.made
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.calls.load(Ordering::SeqCst))
                .sum()
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn create(&self, service: &str, _url: &str) -> Result<Arc<dyn McpTransport>, TransportError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let next = self.sequence.lock().unwrap().pop_front();
            let transport = next.unwrap_or_else(|| (self.build)(service));
            self.made.lock().unwrap().push(Arc::clone(&transport));
            Ok(transport)
        }
    }
}
