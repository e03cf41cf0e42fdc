//! tracking-service - 后台位置追踪 agent
//!
//! 长驻后台进程可靠地采集并投递位置采样：单一追踪会话、
//! 跨进程重启的 liveness 提示、干净的命令/事件接口。
//!
//! # 核心组件
//!
//! - **AgentController**: 唯一的有状态核心，串行处理 Start/Stop，
//!   保证 guard token 与位置更新成对获取/释放
//! - **LocationSource**: OS 位置能力抽象（轮询/监听两个变体）
//! - **LifecycleGuard**: keep-alive token（会话期间不被收割）
//! - **命令通道**: Unix Socket + JSONL，命令一问一答，事件按订阅推送
//!
//! # Feature Flags
//!
//! - `agent`: daemon 侧（controller + source + server）
//! - `client`: Agent Client（供控制端组件使用）
//!
//! # 架构
//!
//! 追踪会话统一由 tracking-agent 进程持有，控制端组件使用
//! AgentClient 通信。命令与 source 事件在同一个 controller 任务里
//! 串行消费，SessionState 没有并发改写路径。

pub mod config;
pub mod error;
pub mod guard;
pub mod protocol;
pub mod source;
pub mod state;
pub mod types;

#[cfg(feature = "agent")]
pub mod agent;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::{AgentConfig, SourceKind};
pub use error::{AgentError, Result};
pub use guard::{FileLockGuard, GuardToken, LifecycleGuard};
pub use protocol::{Event, EventType, Push, QueryType, Request, Response, StatusSnapshot};
pub use source::{LocationSource, PollingSource, SourceEvent, UpdateOptions};
pub use state::{StateFlag, TrackingFlag};
pub use types::{AccuracyHint, ErrorKind, LocationFix, PermissionState, SessionState};

#[cfg(feature = "agent")]
pub use agent::{cleanup_stale_agent, is_agent_running, Agent, AgentController, ControllerHandle};

#[cfg(feature = "agent")]
pub use source::WatchedSource;

#[cfg(feature = "client")]
pub use client::{connect_or_start_agent, AgentClient, ClientConfig};
