//! tracking-agent - 后台位置追踪守护进程
//!
//! 负责：
//! - 持有唯一追踪会话
//! - 驱动位置源 + keep-alive guard
//! - 命令一问一答、事件按订阅推送
//! - 持久化 liveness 标志

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracking_service::agent::{cleanup_stale_agent, is_agent_running, Agent};
use tracking_service::config::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tracking_service=debug".parse()?))
        .init();

    tracing::info!("🚀 tracking-agent v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = AgentConfig::default();

    // 检查是否已有 Agent 运行
    if is_agent_running(&config) {
        tracing::error!("❌ Agent is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_agent(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 创建并运行 Agent
    let agent = Arc::new(Agent::new(config)?);
    agent.run().await?;

    tracing::info!("👋 tracking-agent exiting");
    Ok(())
}
