//! 工作流编排：规划 → 审批 → 分步执行 → 人工修订循环 → 完成

pub mod agents;
pub mod events;
pub mod orchestrator;
pub mod store;
pub mod types;

pub use agents::{
    AgentOutput, AgentRegistry, AnalysisAgent, InMemoryPersistence, JsonlPersistence,
    KeywordPlanner, Persistence, Planner, SavedRecord, SpecializedAgent, ToolAgent,
};
pub use events::{
    BroadcastEventSink, ChannelEventSink, EventKind, EventSink, LogEventSink, MessageStatus,
    WorkflowEvent,
};
pub use orchestrator::{is_approval, WorkflowOrchestrator};
pub use store::{InMemoryWorkflowStore, WorkflowStore};
pub use types::*;
