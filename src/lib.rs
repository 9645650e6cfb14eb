//! Hive - 多智能体工作流编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复建议、组件装配、优雅关闭
//! - **mcp**: 远程工具服务调用层（连接、三层重试、Mock 模式、健康检查）
//! - **observability**: 日志初始化与健康上报
//! - **workflow**: 可恢复的人机协同工作流状态机

pub mod config;
pub mod core;
pub mod mcp;
pub mod observability;
pub mod workflow;

pub use crate::core::{HiveBuilder, HiveComponents};
pub use crate::workflow::WorkflowOrchestrator;
