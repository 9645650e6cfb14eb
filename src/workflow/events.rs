//! 编排器对外发出的事件
//!
//! 五类副作用，每个事件带实例 id 与 ISO-8601 UTC 时间戳。投递尽力而为：
//! 接收端已关闭不会影响工作流推进。

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::workflow::types::{now_rfc3339, PlanStep, WorkflowStatus};

/// agent_message 的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Completed,
    AwaitingApproval,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PlanApprovalRequest {
        request_id: String,
        proposed_steps: Vec<PlanStep>,
    },
    AgentMessage {
        agent: String,
        content: String,
        status: MessageStatus,
    },
    UserClarificationRequest {
        request_id: String,
        latest_output: String,
        question: String,
    },
    FinalResultMessage {
        content: String,
        status: WorkflowStatus,
    },
    ExtractionApprovalRequest {
        request_id: String,
        agent: String,
        payload: Value,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlanApprovalRequest { .. } => "plan_approval_request",
            Self::AgentMessage { .. } => "agent_message",
            Self::UserClarificationRequest { .. } => "user_clarification_request",
            Self::FinalResultMessage { .. } => "final_result_message",
            Self::ExtractionApprovalRequest { .. } => "extraction_approval_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEvent {
    pub instance_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl WorkflowEvent {
    pub fn new(instance_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp: now_rfc3339(),
            kind,
        }
    }
}

/// 事件接收端（实时传输层由外部实现）
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// 点对点通道，适合单个消费者（控制台、测试）
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: WorkflowEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}

/// 广播，多个订阅者各自收到一份（SSE）
#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: WorkflowEvent) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.tx.send(event);
    }
}

/// 只写日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: WorkflowEvent) {
        tracing::info!(
            instance_id = %event.instance_id,
            event = event.kind.name(),
            "Workflow event"
        );
    }
}
