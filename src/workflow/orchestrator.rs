//! 工作流编排器
//!
//! Planning → AwaitingPlanApproval → (Rejected | Executing) → AwaitingStepApproval*
//! → (Executing | AwaitingClarification) → Completed | Failed
//!
//! 每个入口都是非阻塞的：推进到下一个需要人工介入的暂停点（或终态）后立即返回。
//! 开启人机协同时每执行完一步就暂停；同意后才执行计划的下一步，修订则重跑当前步骤的 Agent。
//! 恢复调用先认领（取走）待恢复记录，同一实例的并发恢复只有一个生效，其余得到 NotResumable。
//! 失败时删除待恢复记录但保留上下文，供诊断查询。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::{AgentError, RecoveryEngine};
use crate::workflow::agents::{AgentOutput, AgentRegistry, Persistence, Planner, SpecializedAgent};
use crate::workflow::events::{EventKind, EventSink, MessageStatus, WorkflowEvent};
use crate::workflow::store::WorkflowStore;
use crate::workflow::types::{
    ExecutionContext, HistoryEntry, NotResumableReason, PendingExecution, Plan, ResumeOutcome,
    StartOptions, WorkflowError, WorkflowState, WorkflowStatus,
};

/// 视为「同意」的回复（大小写不敏感）
const APPROVAL_TOKENS: [&str; 4] = ["ok", "yes", "approve", "approved"];

const CLARIFICATION_QUESTION: &str =
    "Reply OK to accept this result, or describe what should change.";

pub fn is_approval(answer: &str) -> bool {
    let a = answer.trim().to_lowercase();
    APPROVAL_TOKENS.contains(&a.as_str())
}

pub struct WorkflowOrchestrator {
    store: Arc<dyn WorkflowStore>,
    planner: Arc<dyn Planner>,
    agents: AgentRegistry,
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
    recovery: RecoveryEngine,
    default_hitl: bool,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        planner: Arc<dyn Planner>,
        agents: AgentRegistry,
        persistence: Arc<dyn Persistence>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            planner,
            agents,
            persistence,
            events,
            recovery: RecoveryEngine::new(),
            default_hitl: true,
        }
    }

    pub fn with_default_hitl(mut self, hitl: bool) -> Self {
        self.default_hitl = hitl;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    fn emit(&self, instance_id: &str, kind: EventKind) {
        self.events.emit(WorkflowEvent::new(instance_id, kind));
    }

    fn new_request_id() -> String {
        format!("req-{}", Uuid::new_v4())
    }

    // ----- 入口 -----

    /// 创建实例、规划并暂停在 AwaitingPlanApproval；返回实例 id
    pub async fn start(&self, task: &str, opts: StartOptions) -> Result<String, WorkflowError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(WorkflowError::EmptyTask);
        }
        let instance_id = Uuid::new_v4().to_string();
        let hitl = opts.hitl.unwrap_or(self.default_hitl);
        let mut ctx = ExecutionContext::new(&instance_id, task, hitl);
        self.store.put_context(ctx.clone()).await;
        tracing::info!(instance_id = %instance_id, hitl, "Workflow started");

        let plan = match self.planner.plan(task).await {
            Ok(plan) if plan.is_empty() => {
                self.fail_start(&mut ctx, "planner proposed no steps").await;
                return Err(WorkflowError::EmptyPlan);
            }
            Ok(plan) => plan,
            Err(e) => {
                self.fail_start(&mut ctx, &e.to_string()).await;
                return Err(WorkflowError::Planning(e));
            }
        };
        if let Some(missing) = plan.steps.iter().find(|s| !self.agents.contains(&s.agent)) {
            let agent = missing.agent.clone();
            self.fail_start(&mut ctx, &format!("unknown agent '{agent}'")).await;
            return Err(WorkflowError::UnknownAgent(agent));
        }

        let request_id = Self::new_request_id();
        ctx.plan = Some(plan.clone());
        ctx.set_status(WorkflowStatus::AwaitingPlanApproval);
        self.store.put_context(ctx).await;
        self.store
            .put_pending(PendingExecution::new(
                &instance_id,
                WorkflowState::AwaitingPlanApproval {
                    plan: plan.clone(),
                    request_id: request_id.clone(),
                },
                hitl,
            ))
            .await;
        self.emit(
            &instance_id,
            EventKind::PlanApprovalRequest {
                request_id,
                proposed_steps: plan.steps,
            },
        );
        tracing::info!(instance_id = %instance_id, "Awaiting plan approval");
        Ok(instance_id)
    }

    /// 计划审批结果
    pub async fn resume_after_plan_approval(
        &self,
        instance_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> ResumeOutcome {
        let (pending, mut ctx) = match self.claim(instance_id, WorkflowStatus::AwaitingPlanApproval).await {
            Ok(claimed) => claimed,
            Err(reason) => return ResumeOutcome::not_resumable(reason),
        };
        let WorkflowState::AwaitingPlanApproval { plan, .. } = pending.state else {
            return ResumeOutcome::not_resumable(NotResumableReason::Unknown);
        };

        if !approved {
            let content = match feedback.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                Some(f) => format!("Plan rejected: {f}"),
                None => "Plan rejected".to_string(),
            };
            return self.reject(ctx, content).await;
        }

        if let Some(f) = feedback.as_deref().filter(|f| !f.trim().is_empty()) {
            tracing::info!(instance_id, feedback = f, "Plan approved with note");
        }
        ctx.plan = Some(plan);
        self.run_steps(ctx, 0).await
    }

    /// 结构化结果（抽取数据）的确认；edited_data 为人工修改后的数据
    pub async fn resume_after_step_approval(
        &self,
        instance_id: &str,
        approved: bool,
        edited_data: Option<Value>,
    ) -> ResumeOutcome {
        let (pending, ctx) = match self.claim(instance_id, WorkflowStatus::AwaitingStepApproval).await {
            Ok(claimed) => claimed,
            Err(reason) => return ResumeOutcome::not_resumable(reason),
        };
        let WorkflowState::AwaitingStepApproval {
            agent,
            payload,
            current_agent_index,
            request_id,
        } = pending.state
        else {
            return ResumeOutcome::not_resumable(NotResumableReason::Unknown);
        };

        if !approved {
            return self
                .reject(ctx, format!("Output of '{agent}' rejected by operator"))
                .await;
        }

        let edited = edited_data.is_some();
        let data = edited_data.unwrap_or(payload);
        let metadata = json!({
            "iteration": ctx.iteration(),
            "edited": edited,
            "request_id": request_id,
        });
        if let Err(e) = self.persistence.save(instance_id, &agent, &data, metadata).await {
            return self.fail(ctx, &agent, self.describe(&e)).await;
        }
        tracing::info!(instance_id, agent = %agent, edited, "Step output approved and saved");
        self.hitl_decision(ctx, current_agent_index).await
    }

    /// 人工澄清：同意词 → 继续计划下一步（最后一步则完成）；其它文本 → 用当前步骤的 Agent 修订
    pub async fn resume_after_clarification(&self, instance_id: &str, answer: &str) -> ResumeOutcome {
        if answer.trim().is_empty() {
            return ResumeOutcome::not_resumable(NotResumableReason::EmptyAnswer);
        }
        let (pending, mut ctx) = match self.claim(instance_id, WorkflowStatus::AwaitingClarification).await {
            Ok(claimed) => claimed,
            Err(reason) => return ResumeOutcome::not_resumable(reason),
        };
        let WorkflowState::AwaitingClarification {
            latest_output,
            current_agent_index,
            ..
        } = pending.state
        else {
            return ResumeOutcome::not_resumable(NotResumableReason::Unknown);
        };

        if is_approval(answer) {
            let next = current_agent_index + 1;
            if next < ctx.plan.as_ref().map(Plan::len).unwrap_or(0) {
                tracing::info!(instance_id, next_step = next, "Step accepted, continuing with plan");
                return self.run_steps(ctx, next).await;
            }
            return self.complete(ctx, latest_output).await;
        }

        let revision = answer.trim().to_string();
        ctx.begin_revision(&revision);
        let Some(agent_name) = ctx.current_agent().map(str::to_string) else {
            return self
                .fail(ctx, "orchestrator", "no active agent recorded for revision".to_string())
                .await;
        };
        let Some(agent) = self.agents.get(&agent_name) else {
            let msg = AgentError::UnknownAgent(agent_name.clone()).to_string();
            return self.fail(ctx, &agent_name, msg).await;
        };
        tracing::info!(
            instance_id,
            agent = %agent_name,
            iteration = ctx.iteration(),
            "Revising with current agent"
        );

        ctx.set_status(WorkflowStatus::Executing);
        self.store.put_context(ctx.clone()).await;

        match self.invoke(agent.as_ref(), &revision, &ctx).await {
            Ok(output) => {
                if let Some(paused) = self
                    .record_step(&mut ctx, &agent_name, output, current_agent_index)
                    .await
                {
                    return paused;
                }
                self.hitl_decision(ctx, current_agent_index).await
            }
            Err(e) => self.fail(ctx, &agent_name, self.describe(&e)).await,
        }
    }

    // ----- 诊断 -----

    pub async fn status(&self, instance_id: &str) -> Option<WorkflowStatus> {
        self.store.context(instance_id).await.map(|c| c.status)
    }

    pub async fn history(&self, instance_id: &str) -> Option<Vec<HistoryEntry>> {
        self.store
            .context(instance_id)
            .await
            .map(|c| c.history().to_vec())
    }

    pub async fn context(&self, instance_id: &str) -> Option<ExecutionContext> {
        self.store.context(instance_id).await
    }

    pub async fn pending(&self, instance_id: &str) -> Option<PendingExecution> {
        self.store.peek_pending(instance_id).await
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.store.pending_ids().await
    }

    // ----- 内部 -----

    /// 认领待恢复记录；状态不符时放回
    async fn claim(
        &self,
        instance_id: &str,
        expected: WorkflowStatus,
    ) -> Result<(PendingExecution, ExecutionContext), NotResumableReason> {
        let Some(pending) = self.store.take_pending(instance_id).await else {
            let reason = match self.store.context(instance_id).await {
                None => NotResumableReason::Unknown,
                Some(ctx) if ctx.status.is_terminal() => NotResumableReason::Terminated { status: ctx.status },
                Some(_) => NotResumableReason::InProgress,
            };
            tracing::debug!(instance_id, %reason, "Resume refused");
            return Err(reason);
        };

        let actual = pending.status();
        if actual != expected {
            self.store.put_pending(pending).await;
            return Err(NotResumableReason::WrongState { expected, actual });
        }

        match self.store.context(instance_id).await {
            Some(ctx) => Ok((pending, ctx)),
            None => {
                tracing::warn!(instance_id, "Pending record without context, dropping it");
                Err(NotResumableReason::Unknown)
            }
        }
    }

    /// 从计划的第 start 步开始执行：人机协同时执行一步后暂停，否则依次跑完并完成
    async fn run_steps(&self, mut ctx: ExecutionContext, start: usize) -> ResumeOutcome {
        let plan = ctx.plan.clone().unwrap_or_default();
        for (index, step) in plan.steps.iter().enumerate().skip(start) {
            ctx.begin_step(&step.agent);
            ctx.set_status(WorkflowStatus::Executing);
            self.store.put_context(ctx.clone()).await;
            tracing::info!(
                instance_id = %ctx.instance_id,
                state = ?WorkflowState::Executing { current_agent_index: index },
                agent = %step.agent,
                "Executing step"
            );

            let Some(agent) = self.agents.get(&step.agent) else {
                let msg = AgentError::UnknownAgent(step.agent.clone()).to_string();
                return self.fail(ctx, &step.agent, msg).await;
            };
            let task = ctx.task.clone();
            match self.invoke(agent.as_ref(), &task, &ctx).await {
                Ok(output) => {
                    if let Some(paused) = self.record_step(&mut ctx, &step.agent, output, index).await {
                        return paused;
                    }
                    if ctx.hitl {
                        return self.await_clarification(ctx, index).await;
                    }
                }
                Err(e) => return self.fail(ctx, &step.agent, self.describe(&e)).await,
            }
        }
        let latest = ctx.latest_output().unwrap_or_default().to_string();
        self.complete(ctx, latest).await
    }

    /// 运行 Agent；panic 也视为该步失败
    async fn invoke(
        &self,
        agent: &dyn SpecializedAgent,
        task: &str,
        ctx: &ExecutionContext,
    ) -> Result<AgentOutput, AgentError> {
        match AssertUnwindSafe(agent.run(task, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Panicked(agent.name().to_string())),
        }
    }

    /// 记录一步结果并发出 agent_message；需要结构化确认时暂停并返回 Some
    async fn record_step(
        &self,
        ctx: &mut ExecutionContext,
        agent: &str,
        output: AgentOutput,
        index: usize,
    ) -> Option<ResumeOutcome> {
        ctx.record_result(agent, output.content.clone());
        let status = if output.requires_approval {
            MessageStatus::AwaitingApproval
        } else {
            MessageStatus::Completed
        };
        self.emit(
            &ctx.instance_id,
            EventKind::AgentMessage {
                agent: agent.to_string(),
                content: output.content.clone(),
                status,
            },
        );

        if !output.requires_approval {
            return None;
        }

        let request_id = Self::new_request_id();
        let payload = output.data.unwrap_or_else(|| json!({ "content": output.content }));
        ctx.set_status(WorkflowStatus::AwaitingStepApproval);
        self.store.put_context(ctx.clone()).await;
        self.store
            .put_pending(PendingExecution::new(
                &ctx.instance_id,
                WorkflowState::AwaitingStepApproval {
                    agent: agent.to_string(),
                    payload: payload.clone(),
                    current_agent_index: index,
                    request_id: request_id.clone(),
                },
                ctx.hitl,
            ))
            .await;
        self.emit(
            &ctx.instance_id,
            EventKind::ExtractionApprovalRequest {
                request_id,
                agent: agent.to_string(),
                payload,
            },
        );
        tracing::info!(instance_id = %ctx.instance_id, agent, "Awaiting step approval");
        Some(ResumeOutcome::resumed(WorkflowStatus::AwaitingStepApproval))
    }

    /// 第 index 步成功后：需要人工 → AwaitingClarification；否则继续剩余步骤直至完成
    async fn hitl_decision(&self, ctx: ExecutionContext, index: usize) -> ResumeOutcome {
        if ctx.hitl {
            self.await_clarification(ctx, index).await
        } else {
            self.run_steps(ctx, index + 1).await
        }
    }

    async fn await_clarification(&self, mut ctx: ExecutionContext, index: usize) -> ResumeOutcome {
        let latest = ctx.latest_output().unwrap_or_default().to_string();
        let request_id = Self::new_request_id();
        ctx.set_status(WorkflowStatus::AwaitingClarification);
        let hitl = ctx.hitl;
        let instance_id = ctx.instance_id.clone();
        self.store.put_context(ctx).await;
        self.store
            .put_pending(PendingExecution::new(
                &instance_id,
                WorkflowState::AwaitingClarification {
                    latest_output: latest.clone(),
                    request_id: request_id.clone(),
                    current_agent_index: index,
                },
                hitl,
            ))
            .await;
        self.emit(
            &instance_id,
            EventKind::UserClarificationRequest {
                request_id,
                latest_output: latest,
                question: CLARIFICATION_QUESTION.to_string(),
            },
        );
        tracing::info!(instance_id = %instance_id, step = index, "Awaiting clarification");
        ResumeOutcome::resumed(WorkflowStatus::AwaitingClarification)
    }

    async fn complete(&self, mut ctx: ExecutionContext, output: String) -> ResumeOutcome {
        ctx.set_status(WorkflowStatus::Completed);
        tracing::info!(
            instance_id = %ctx.instance_id,
            steps = ctx.history().len(),
            "Workflow completed"
        );
        self.emit(
            &ctx.instance_id,
            EventKind::FinalResultMessage {
                content: output,
                status: WorkflowStatus::Completed,
            },
        );
        self.store.remove_context(&ctx.instance_id).await;
        ResumeOutcome::resumed(WorkflowStatus::Completed)
    }

    async fn reject(&self, mut ctx: ExecutionContext, content: String) -> ResumeOutcome {
        ctx.set_status(WorkflowStatus::Rejected);
        tracing::info!(instance_id = %ctx.instance_id, "Workflow rejected");
        self.emit(
            &ctx.instance_id,
            EventKind::FinalResultMessage {
                content,
                status: WorkflowStatus::Rejected,
            },
        );
        self.store.remove_context(&ctx.instance_id).await;
        ResumeOutcome::resumed(WorkflowStatus::Rejected)
    }

    /// 失败：不再可恢复，但保留上下文
    async fn fail(&self, mut ctx: ExecutionContext, agent: &str, message: String) -> ResumeOutcome {
        tracing::warn!(instance_id = %ctx.instance_id, agent, "Workflow failed: {}", message);
        ctx.set_status(WorkflowStatus::Failed);
        ctx.error = Some(message.clone());
        self.emit(
            &ctx.instance_id,
            EventKind::AgentMessage {
                agent: agent.to_string(),
                content: message.clone(),
                status: MessageStatus::Failed,
            },
        );
        self.emit(
            &ctx.instance_id,
            EventKind::FinalResultMessage {
                content: message,
                status: WorkflowStatus::Failed,
            },
        );
        self.store.put_context(ctx).await;
        ResumeOutcome::resumed(WorkflowStatus::Failed)
    }

    async fn fail_start(&self, ctx: &mut ExecutionContext, message: &str) {
        tracing::warn!(instance_id = %ctx.instance_id, "Planning failed: {}", message);
        ctx.set_status(WorkflowStatus::Failed);
        ctx.error = Some(message.to_string());
        self.store.put_context(ctx.clone()).await;
    }

    /// 面向操作员的失败说明
    fn describe(&self, err: &AgentError) -> String {
        match err {
            AgentError::Mcp(e) => self.recovery.advise(e).message,
            other => other.to_string(),
        }
    }
}
