//! 可观测性：日志初始化与健康上报

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::mcp::HealthReport;

/// 安装全局 tracing subscriber；RUST_LOG 未设置时默认 info。重复调用无副作用。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 健康 / 遥测汇报目标（尽力而为，不影响调用方）
pub trait HealthSink: Send + Sync {
    fn report(&self, report: &HealthReport);
}

/// 仅写日志的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthSink;

impl HealthSink for TracingHealthSink {
    fn report(&self, report: &HealthReport) {
        if report.healthy {
            tracing::info!(
                service = %report.service,
                latency_ms = report.latency_ms,
                tool_calls = report.tool_count,
                mock_mode = report.mock_mode,
                "Service healthy"
            );
        } else {
            tracing::warn!(
                service = %report.service,
                error = report.error.as_deref().unwrap_or("unknown"),
                "Service unhealthy"
            );
        }
    }
}
