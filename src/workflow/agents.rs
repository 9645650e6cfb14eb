//! 编排器依赖的外部协作者
//!
//! - Planner：任务 → 有序 Agent 列表（含理由）
//! - SpecializedAgent：执行一步，可声明输出需要结构化确认
//! - Persistence：保存确认后的结果
//!
//! 另提供可直接运行的默认实现：KeywordPlanner、ToolAgent、AnalysisAgent、
//! InMemoryPersistence、JsonlPersistence。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{AgentSection, PlannerSection};
use crate::core::AgentError;
use crate::mcp::ServiceRegistry;
use crate::workflow::types::{now_rfc3339, ExecutionContext, Plan, PlanStep, HUMAN_AGENT};

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &str) -> Result<Plan, AgentError>;
}

/// 一步的输出
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// 面向人的文本
    pub content: String,
    /// 结构化数据（如抽取结果）
    pub data: Option<Value>,
    /// 是否需要操作员确认 data 后才算最终结果
    pub requires_approval: bool,
}

impl AgentOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
            requires_approval: false,
        }
    }
}

#[async_trait]
pub trait SpecializedAgent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, task: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError>;
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save(
        &self,
        instance_id: &str,
        agent: &str,
        content: &Value,
        metadata: Value,
    ) -> Result<(), AgentError>;
}

/// 名称 → Agent
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn SpecializedAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn SpecializedAgent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn SpecializedAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SpecializedAgent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按 [[agents]] 配置注册 ToolAgent，并总是注册 AnalysisAgent
    pub fn from_config(sections: &[AgentSection], registry: Arc<ServiceRegistry>) -> Self {
        let mut agents = Self::new().with(Arc::new(AnalysisAgent));
        for s in sections {
            agents.register(Arc::new(ToolAgent::from_section(s, Arc::clone(&registry))));
        }
        agents
    }
}

/// 关键词规划器：按规则顺序收集命中的 Agent，再追加默认 Agent（去重）
pub struct KeywordPlanner {
    section: PlannerSection,
}

impl KeywordPlanner {
    pub fn new(section: PlannerSection) -> Self {
        Self { section }
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, task: &str) -> Result<Plan, AgentError> {
        let lowered = task.to_lowercase();
        let mut steps: Vec<PlanStep> = Vec::new();

        for rule in &self.section.rules {
            if steps.iter().any(|s| s.agent == rule.agent) {
                continue;
            }
            if let Some(kw) = rule
                .keywords
                .iter()
                .find(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
            {
                steps.push(PlanStep {
                    agent: rule.agent.clone(),
                    rationale: rule
                        .rationale
                        .clone()
                        .unwrap_or_else(|| format!("task mentions '{kw}'")),
                });
            }
        }

        for agent in &self.section.default_agents {
            if !steps.iter().any(|s| &s.agent == agent) {
                steps.push(PlanStep {
                    agent: agent.clone(),
                    rationale: "default step".to_string(),
                });
            }
        }

        if steps.is_empty() {
            return Err(AgentError::Planning(format!("no agent matches task '{task}'")));
        }
        tracing::debug!(agents = ?steps.iter().map(|s| &s.agent).collect::<Vec<_>>(), "Planned");
        Ok(Plan::new(steps))
    }
}

/// 调用一个远程工具的 Agent：参数为 {"query": task}
pub struct ToolAgent {
    name: String,
    description: String,
    service: String,
    tool: String,
    requires_approval: bool,
    registry: Arc<ServiceRegistry>,
}

impl ToolAgent {
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        tool: impl Into<String>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            service: service.into(),
            tool: tool.into(),
            requires_approval: false,
            registry,
        }
    }

    pub fn from_section(section: &AgentSection, registry: Arc<ServiceRegistry>) -> Self {
        let mut agent = Self::new(&section.name, &section.service, &section.tool, registry)
            .requiring_approval(section.requires_approval);
        agent.description = section.description.clone().unwrap_or_default();
        agent
    }

    pub fn requiring_approval(mut self, yes: bool) -> Self {
        self.requires_approval = yes;
        self
    }
}

#[async_trait]
impl SpecializedAgent for ToolAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, task: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError> {
        if task.trim().is_empty() {
            return Err(AgentError::InvalidInput("empty task".into()));
        }
        tracing::info!(
            instance_id = %ctx.instance_id,
            agent = %self.name,
            service = %self.service,
            tool = %self.tool,
            "Invoking tool agent"
        );
        let result = self
            .registry
            .call_tool(&self.service, &self.tool, json!({ "query": task }))
            .await?;
        let data = Value::Object(result);
        let content = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
        Ok(AgentOutput {
            content,
            data: Some(data),
            requires_approval: self.requires_approval,
        })
    }
}

/// 本地汇总此前各步结果的 Agent（不触网）
pub struct AnalysisAgent;

impl AnalysisAgent {
    pub const NAME: &'static str = "analysis";
}

#[async_trait]
impl SpecializedAgent for AnalysisAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Summarizes what earlier steps found"
    }

    async fn run(&self, task: &str, ctx: &ExecutionContext) -> Result<AgentOutput, AgentError> {
        let findings: Vec<_> = ctx
            .history()
            .iter()
            .filter(|e| e.agent != Self::NAME && e.agent != HUMAN_AGENT)
            .collect();

        let mut out = format!("Analysis for: {task}\n");
        if findings.is_empty() {
            out.push_str("No earlier findings to analyze.");
        } else {
            out.push_str(&format!("{} earlier step(s):\n", findings.len()));
            for e in findings {
                let first = e.result.lines().next().unwrap_or("");
                let first: String = first.chars().take(120).collect();
                out.push_str(&format!("- [{}] {}\n", e.agent, first));
            }
        }
        let feedback: Vec<_> = ctx.history().iter().filter_map(|e| e.feedback.as_deref()).collect();
        if let Some(last) = feedback.last() {
            out.push_str(&format!("Latest operator feedback: {last}\n"));
        }
        Ok(AgentOutput::text(out.trim_end()))
    }
}

/// 已保存的一条结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub instance_id: String,
    pub agent: String,
    pub content: Value,
    pub metadata: Value,
    pub saved_at: String,
}

#[derive(Default)]
pub struct InMemoryPersistence {
    records: Mutex<Vec<SavedRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<SavedRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn save(
        &self,
        instance_id: &str,
        agent: &str,
        content: &Value,
        metadata: Value,
    ) -> Result<(), AgentError> {
        self.records.lock().await.push(SavedRecord {
            instance_id: instance_id.to_string(),
            agent: agent.to_string(),
            content: content.clone(),
            metadata,
            saved_at: now_rfc3339(),
        });
        Ok(())
    }
}

/// 追加写 JSON Lines 文件；父目录不存在时自动创建
pub struct JsonlPersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录；文件不存在时返回空 Vec
    pub async fn load(&self) -> Result<Vec<SavedRecord>, AgentError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::Persistence(e.to_string())),
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| AgentError::Persistence(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl Persistence for JsonlPersistence {
    async fn save(
        &self,
        instance_id: &str,
        agent: &str,
        content: &Value,
        metadata: Value,
    ) -> Result<(), AgentError> {
        let record = SavedRecord {
            instance_id: instance_id.to_string(),
            agent: agent.to_string(),
            content: content.clone(),
            metadata,
            saved_at: now_rfc3339(),
        };
        let mut line =
            serde_json::to_string(&record).map_err(|e| AgentError::Persistence(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::Persistence(e.to_string()))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AgentError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        Ok(())
    }
}
