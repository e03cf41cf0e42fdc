//! Agent Client 模块
//!
//! 供控制端组件连接 tracking-agent 的客户端功能

mod connect;

pub use connect::{connect_or_start_agent, AgentClient, ClientConfig};
