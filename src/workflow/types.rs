//! 工作流类型定义
//!
//! 状态机的状态（WorkflowStatus）、每个状态携带的数据（WorkflowState）、
//! 执行上下文（ExecutionContext）与待恢复记录（PendingExecution）。

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::AgentError;

pub type InstanceId = String;

/// 当前时刻的 ISO-8601 UTC 时间戳
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 工作流状态（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Planning,
    AwaitingPlanApproval,
    Executing,
    /// 某一步的结构化输出需要人工确认
    AwaitingStepApproval,
    AwaitingClarification,
    Completed,
    Rejected,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// 是否处于等待外部信号的暂停状态
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            Self::AwaitingPlanApproval | Self::AwaitingStepApproval | Self::AwaitingClarification
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::AwaitingPlanApproval => "awaiting_plan_approval",
            Self::Executing => "executing",
            Self::AwaitingStepApproval => "awaiting_step_approval",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 计划中的一步：由哪个 Agent 执行，以及选择它的理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.agent.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 每个状态携带的数据，只含该状态下有效的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowState {
    Planning,
    AwaitingPlanApproval {
        plan: Plan,
        request_id: String,
    },
    Executing {
        current_agent_index: usize,
    },
    AwaitingStepApproval {
        agent: String,
        payload: Value,
        /// 产生该输出的计划步骤
        current_agent_index: usize,
        request_id: String,
    },
    AwaitingClarification {
        latest_output: String,
        request_id: String,
        /// 刚执行完的计划步骤；同意后从下一步继续
        current_agent_index: usize,
    },
    Completed {
        final_output: String,
    },
    Rejected {
        feedback: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl WorkflowState {
    pub fn status(&self) -> WorkflowStatus {
        match self {
            Self::Planning => WorkflowStatus::Planning,
            Self::AwaitingPlanApproval { .. } => WorkflowStatus::AwaitingPlanApproval,
            Self::Executing { .. } => WorkflowStatus::Executing,
            Self::AwaitingStepApproval { .. } => WorkflowStatus::AwaitingStepApproval,
            Self::AwaitingClarification { .. } => WorkflowStatus::AwaitingClarification,
            Self::Completed { .. } => WorkflowStatus::Completed,
            Self::Rejected { .. } => WorkflowStatus::Rejected,
            Self::Failed { .. } => WorkflowStatus::Failed,
        }
    }

    /// 未决审批请求的标识（仅暂停状态有）
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::AwaitingPlanApproval { request_id, .. }
            | Self::AwaitingStepApproval { request_id, .. }
            | Self::AwaitingClarification { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// 历史记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub agent: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub timestamp: String,
}

/// 人工反馈条目使用的 agent 名
pub const HUMAN_AGENT: &str = "human";

/// 单个工作流实例的执行上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub instance_id: InstanceId,
    pub task: String,
    pub status: WorkflowStatus,
    pub hitl: bool,
    pub plan: Option<Plan>,
    history: Vec<HistoryEntry>,
    iteration: u32,
    current_agent: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ExecutionContext {
    pub fn new(instance_id: impl Into<String>, task: impl Into<String>, hitl: bool) -> Self {
        let now = now_rfc3339();
        Self {
            instance_id: instance_id.into(),
            task: task.into(),
            status: WorkflowStatus::Planning,
            hitl,
            plan: None,
            history: Vec::new(),
            iteration: 0,
            current_agent: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.current_agent.as_deref()
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = now_rfc3339();
    }

    /// 进入计划的下一步：设定当前 Agent（修订时复用它）
    pub fn begin_step(&mut self, agent: &str) {
        self.current_agent = Some(agent.to_string());
        self.updated_at = now_rfc3339();
    }

    /// 记录一次 Agent 执行结果；不改变当前 Agent
    pub fn record_result(&mut self, agent: &str, result: impl Into<String>) {
        self.history.push(HistoryEntry {
            iteration: self.iteration,
            agent: agent.to_string(),
            result: result.into(),
            feedback: None,
            timestamp: now_rfc3339(),
        });
        self.updated_at = now_rfc3339();
    }

    /// 进入下一轮修订：迭代号 +1，并追加一条携带人工反馈的占位记录
    pub fn begin_revision(&mut self, feedback: impl Into<String>) {
        self.iteration += 1;
        self.history.push(HistoryEntry {
            iteration: self.iteration,
            agent: HUMAN_AGENT.to_string(),
            result: String::new(),
            feedback: Some(feedback.into()),
            timestamp: now_rfc3339(),
        });
        self.updated_at = now_rfc3339();
    }

    /// 最近一次 Agent 输出（跳过人工反馈条目）
    pub fn latest_output(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|e| e.agent != HUMAN_AGENT)
            .map(|e| e.result.as_str())
    }
}

/// 待恢复记录：当且仅当工作流暂停等待外部信号时存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExecution {
    pub instance_id: InstanceId,
    pub state: WorkflowState,
    pub hitl: bool,
    pub created_at: String,
}

impl PendingExecution {
    pub fn new(instance_id: impl Into<String>, state: WorkflowState, hitl: bool) -> Self {
        Self {
            instance_id: instance_id.into(),
            state,
            hitl,
            created_at: now_rfc3339(),
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.state.request_id()
    }
}

/// 为什么拒绝本次恢复
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotResumableReason {
    /// 从未启动，或已结束并被清理
    Unknown,
    /// 已结束但上下文仍保留（如 Failed）
    Terminated { status: WorkflowStatus },
    /// 另一个恢复调用正在处理该实例
    InProgress,
    /// 实例暂停在另一个状态
    WrongState {
        expected: WorkflowStatus,
        actual: WorkflowStatus,
    },
    /// 澄清回复为空
    EmptyAnswer,
}

impl std::fmt::Display for NotResumableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown or finished workflow"),
            Self::Terminated { status } => write!(f, "workflow already {status}"),
            Self::InProgress => write!(f, "another resume is in progress"),
            Self::WrongState { expected, actual } => {
                write!(f, "workflow is {actual}, expected {expected}")
            }
            Self::EmptyAnswer => write!(f, "empty answer"),
        }
    }
}

/// 恢复调用的结果（从不以错误形式返回）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// 已处理；status 为处理后所处的状态
    Resumed { status: WorkflowStatus },
    NotResumable { reason: NotResumableReason },
}

impl ResumeOutcome {
    pub fn resumed(status: WorkflowStatus) -> Self {
        Self::Resumed { status }
    }

    pub fn not_resumable(reason: NotResumableReason) -> Self {
        Self::NotResumable { reason }
    }

    pub fn status(&self) -> Option<WorkflowStatus> {
        match self {
            Self::Resumed { status } => Some(*status),
            Self::NotResumable { .. } => None,
        }
    }

    pub fn is_not_resumable(&self) -> bool {
        matches!(self, Self::NotResumable { .. })
    }
}

/// 启动阶段的错误
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Task must not be empty")]
    EmptyTask,

    #[error("Planner failed: {0}")]
    Planning(#[source] AgentError),

    #[error("Planner proposed no steps")]
    EmptyPlan,

    #[error("Plan references unknown agent '{0}'")]
    UnknownAgent(String),
}

/// start 的可选参数
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// 覆盖默认的人机协同开关
    pub hitl: Option<bool>,
}

impl StartOptions {
    pub fn hitl(enabled: bool) -> Self {
        Self { hitl: Some(enabled) }
    }
}
