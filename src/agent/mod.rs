//! Agent 模块 - 追踪会话的守护端
//!
//! Agent 负责：
//! - 持有唯一的追踪会话（SessionState）
//! - 驱动 LocationSource 与 LifecycleGuard（成对获取/释放）
//! - 通过 Unix Socket 接受命令、推送事件
//! - 持久化 liveness 标志（跨重启 best-effort 提示）

mod broadcaster;
mod controller;
mod server;

pub use broadcaster::{Broadcaster, ConnId};
pub use controller::{spawn, AgentController, Command, ControllerHandle, AGENT_VERSION};
pub use server::{cleanup_stale_agent, is_agent_running, Agent};
