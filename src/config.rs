//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__MCP__MOCK_MODE=true`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp::{RetryPolicies, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub mcp: McpSection,
    pub workflow: WorkflowSection,
    pub planner: PlannerSection,
    pub agents: Vec<AgentSection>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 审批通过的结构化结果写入的 JSONL 文件；未设置时只保存在内存
    pub persistence_path: Option<PathBuf>,
    /// hive-server 监听地址
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            persistence_path: None,
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// [mcp] 段：Mock 开关、超时、三层重试、服务地址
#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    /// 进程级 Mock 开关：打开后所有远程工具调用返回合成数据，不发起任何网络请求
    #[serde(default)]
    pub mock_mode: bool,
    /// 单次调用 / 连接的默认超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// 连续健康检查失败多少次后标记为断开
    #[serde(default = "default_max_health_failures")]
    pub max_health_failures: u32,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub services: HashMap<String, ServiceSection>,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            mock_mode: false,
            default_timeout_secs: default_timeout_secs(),
            max_health_failures: default_max_health_failures(),
            retry: RetrySection::default(),
            services: HashMap::new(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_health_failures() -> u32 {
    3
}

/// [mcp.services.<name>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub url: String,
    /// 覆盖 default_timeout_secs
    pub timeout_secs: Option<u64>,
}

/// [mcp.retry] 段：连接层 / 单次调用层 / 管理层，各自独立配置
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_connect_tier")]
    pub connect: RetryTierSection,
    #[serde(default = "default_tool_call_tier")]
    pub tool_call: RetryTierSection,
    #[serde(default = "default_manager_tier")]
    pub manager: RetryTierSection,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connect: default_connect_tier(),
            tool_call: default_tool_call_tier(),
            manager: default_manager_tier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryTierSection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_jitter() -> f64 {
    0.2
}

fn default_connect_tier() -> RetryTierSection {
    RetryTierSection {
        max_attempts: 3,
        base_backoff_ms: 1_000,
        max_backoff_ms: 10_000,
        jitter: default_jitter(),
    }
}

fn default_tool_call_tier() -> RetryTierSection {
    RetryTierSection {
        max_attempts: 3,
        base_backoff_ms: 1_000,
        max_backoff_ms: 10_000,
        jitter: default_jitter(),
    }
}

fn default_manager_tier() -> RetryTierSection {
    RetryTierSection {
        max_attempts: 2,
        base_backoff_ms: 2_000,
        max_backoff_ms: 10_000,
        jitter: default_jitter(),
    }
}

impl RetryTierSection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetrySection {
    pub fn to_policies(&self) -> RetryPolicies {
        RetryPolicies {
            connect: self.connect.to_policy(),
            tool_call: self.tool_call.to_policy(),
            manager: self.manager.to_policy(),
        }
    }
}

/// [workflow] 段
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 新工作流默认是否需要人工确认每一步结果
    #[serde(default = "default_hitl")]
    pub hitl: bool,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self { hitl: default_hitl() }
    }
}

fn default_hitl() -> bool {
    true
}

/// [planner] 段：关键词规则 → Agent
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlannerSection {
    /// 所有规则都未命中时的计划；也会追加在命中规则之后（去重）
    #[serde(default)]
    pub default_agents: Vec<String>,
    #[serde(default)]
    pub rules: Vec<PlannerRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerRule {
    pub agent: String,
    pub keywords: Vec<String>,
    pub rationale: Option<String>,
}

/// [[agents]] 段：一个远程工具即一个专职 Agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub name: String,
    pub service: String,
    pub tool: String,
    pub description: Option<String>,
    /// 输出是否需要操作员确认（如抽取出的结构化数据）
    #[serde(default)]
    pub requires_approval: bool,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
