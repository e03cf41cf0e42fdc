//! AgentController - 会话核心
//!
//! 唯一的有状态核心：持有 SessionState，串行处理 Start/Stop 命令，
//! 把 LocationSource 事件桥接到命令通道，并保证 at-most-one-active-session。
//!
//! 串行化方式：一个 controller 任务独占 `AgentController`，命令经
//! mpsc + oneshot 排队（`Starting` 期间到达的 Stop 在队列里等待，
//! 绝不交错）。source 事件同样 marshal 进该任务，状态绝不被事件
//! 投递线程直接改写。
//!
//! 不变式：`Active` ⇔ source 更新已开启 且 guard token 被持有。
//! 两者由 Start/Stop 成对获取/释放，中途失败完整回滚到 `Idle`。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::broadcaster::Broadcaster;
use crate::error::{AgentError, Result};
use crate::guard::{GuardToken, LifecycleGuard};
use crate::protocol::{Event, Response, StatusSnapshot};
use crate::source::{LocationSource, SourceEvent, UpdateOptions};
use crate::state::StateFlag;
use crate::types::{PermissionState, SessionState};

/// Agent 版本号（跟随 crate 版本）
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// source 事件通道容量
const SOURCE_CHANNEL_CAPACITY: usize = 100;

/// controller 命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 开始追踪（幂等：已在追踪返回成功，不产生第二个 Started）
    Start { resume_token: Option<String> },
    /// 停止追踪（幂等；永不卡死）
    Stop,
    /// 是否在追踪（纯读）
    IsRunning,
    /// 状态快照（纯读）
    Status,
}

/// 会话核心
pub struct AgentController {
    state: SessionState,
    permission: PermissionState,
    source: Arc<dyn LocationSource>,
    guard: Arc<dyn LifecycleGuard>,
    broadcaster: Arc<Broadcaster>,
    options: UpdateOptions,
    guard_timeout: Duration,
    state_flag: StateFlag,
    /// keep-alive token，Active 期间独占持有
    token: Option<GuardToken>,
    resume_token: Option<String>,
    /// enable_updates 时交给 source 的事件入口
    source_tx: mpsc::Sender<SourceEvent>,
}

impl AgentController {
    /// 创建 controller
    ///
    /// 返回的 Receiver 是 source 事件的出口，必须和命令一起在
    /// 同一个串行执行点消费（见 [`spawn`]）。
    pub fn new(
        source: Arc<dyn LocationSource>,
        guard: Arc<dyn LifecycleGuard>,
        broadcaster: Arc<Broadcaster>,
        options: UpdateOptions,
        guard_timeout: Duration,
        state_flag: StateFlag,
    ) -> (Self, mpsc::Receiver<SourceEvent>) {
        let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);

        let controller = Self {
            state: SessionState::Idle,
            permission: PermissionState::NotDetermined,
            source,
            guard,
            broadcaster,
            options,
            guard_timeout,
            state_flag,
            token: None,
            resume_token: None,
            source_tx,
        };
        (controller, source_rx)
    }

    /// 当前会话状态
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 处理命令（唯一入口；调用方必须保证互斥，不并发调用）
    pub async fn handle(&mut self, command: Command) -> Response {
        match command {
            Command::Start { resume_token } => match self.handle_start(resume_token).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error {
                    code: e.code(),
                    message: e.to_string(),
                },
            },

            Command::Stop => {
                self.handle_stop().await;
                Response::Ok
            }

            Command::IsRunning => Response::Running {
                running: self.state.is_running(),
            },

            Command::Status => {
                let flag = self.state_flag.load();
                let snapshot = StatusSnapshot {
                    agent_version: AGENT_VERSION.to_string(),
                    session_state: self.state,
                    permission: self.permission,
                    tracking_flag: flag.tracking,
                    resume_token: self.resume_token.clone(),
                };
                match serde_json::to_value(&snapshot) {
                    Ok(data) => Response::QueryResult { data },
                    Err(e) => Response::Error {
                        code: 500,
                        message: format!("序列化状态失败: {}", e),
                    },
                }
            }
        }
    }

    /// 处理 source 事件（异步到达，已 marshal 进串行执行点）
    pub async fn on_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Fix(fix) => {
                // 只在 Active 转发；Stopping/Idle 期间到达的 fix 丢弃，不排队
                if self.state == SessionState::Active {
                    self.broadcaster.broadcast(Event::Location(fix));
                } else {
                    tracing::trace!("丢弃 {} 态收到的 fix", self.state);
                }
            }

            SourceEvent::Permission(permission) => {
                self.permission = permission;
                self.broadcaster.broadcast(Event::Permission(permission));

                if permission == PermissionState::Denied && self.state == SessionState::Active {
                    tracing::info!("权限被收回，停止追踪");
                    // PermissionChanged 已广播，随后是 Stopped
                    self.do_stop().await;
                }
            }
        }
    }

    /// Start：Idle → Starting → Active，任何一步失败完整回滚到 Idle
    async fn handle_start(&mut self, resume_token: Option<String>) -> Result<()> {
        if self.state.is_running() {
            // AlreadyInState：幂等成功，不发第二个 Started
            tracing::debug!("Start 命中幂等 no-op: state={}", self.state);
            return Ok(());
        }
        if self.state == SessionState::Stopping {
            // 串行执行下 Stopping 不会停留到下一条命令，防御性拒绝
            return Err(AgentError::Channel("会话正在停止".to_string()));
        }

        self.state = SessionState::Starting;

        match self.start_sequence(resume_token).await {
            Ok(resume) => {
                self.state = SessionState::Active;
                self.resume_token = Some(resume.clone());
                self.state_flag.store(true, Some(&resume));
                tracing::info!("🚀 追踪已启动: resume_token={}", resume);
                self.broadcaster.broadcast(Event::Started {
                    resume_token: Some(resume),
                });
                Ok(())
            }
            Err(e) => {
                // 回滚已在 start_sequence 内完成，这里只收尾状态与上报
                self.state = SessionState::Idle;
                tracing::warn!("Start 失败，已回滚到 Idle: {}", e);
                self.broadcaster.broadcast(Event::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Start 的获取序列：权限 → guard token → source 更新
    ///
    /// 失败时释放已获取的部分再返回（token 与 source 成对）。
    async fn start_sequence(&mut self, resume_token: Option<String>) -> Result<String> {
        // 1. 权限
        if self.permission != PermissionState::Granted {
            let permission = self.source.request_permission().await?;
            self.permission = permission;
            if permission == PermissionState::Denied {
                return Err(AgentError::PermissionDenied);
            }
            // NotDetermined 继续：更新会在授权后开始流动
        }

        // 2. guard token（唯一允许慢的一步，带超时）
        let token = match tokio::time::timeout(self.guard_timeout, self.guard.acquire()).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AgentError::GuardAcquisitionFailed(format!(
                    "获取超时 ({:?})",
                    self.guard_timeout
                )));
            }
        };

        // 3. source 更新；失败则释放刚拿到的 token
        if let Err(e) = self
            .source
            .enable_updates(self.options, self.source_tx.clone())
            .await
        {
            self.guard.release(token).await;
            return Err(e);
        }

        self.token = Some(token);
        Ok(resume_token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }

    /// Stop：幂等；无论 source 是否配合都走到 Idle
    async fn handle_stop(&mut self) {
        if !self.state.is_running() {
            // AlreadyInState：幂等成功，不发第二个 Stopped
            tracing::debug!("Stop 命中幂等 no-op: state={}", self.state);
            return;
        }
        self.do_stop().await;
    }

    /// 实际停止序列（命令路径与权限回收路径共用）
    async fn do_stop(&mut self) {
        self.state = SessionState::Stopping;

        // source 关闭失败只记日志：Stop 永不卡死
        if let Err(e) = self.source.disable_updates().await {
            tracing::warn!("关闭 source 更新失败（忽略）: {}", e);
        }

        // release 幂等，回滚路径重复释放无害
        if let Some(token) = self.token.take() {
            self.guard.release(token).await;
        }

        self.state = SessionState::Idle;
        self.resume_token = None;
        self.state_flag.store(false, None);
        tracing::info!("🛑 追踪已停止");
        self.broadcaster.broadcast(Event::Stopped);
    }
}

/// 发往 controller 任务的消息
enum ControllerMsg {
    Command {
        command: Command,
        reply: oneshot::Sender<Response>,
    },
    /// 轻量状态探针（idle checker 用）
    StateProbe(oneshot::Sender<SessionState>),
}

/// controller 任务的句柄（clone 给各连接 handler）
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMsg>,
}

impl ControllerHandle {
    /// 发送命令并等待响应（逻辑请求 exactly-once）
    pub async fn command(&self, command: Command) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControllerMsg::Command {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::Channel("controller 任务已退出".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AgentError::Channel("controller 未回复".to_string()))
    }

    /// 查询当前会话状态
    pub async fn session_state(&self) -> Result<SessionState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControllerMsg::StateProbe(reply_tx))
            .await
            .map_err(|_| AgentError::Channel("controller 任务已退出".to_string()))?;
        reply_rx
            .await
            .map_err(|_| AgentError::Channel("controller 未回复".to_string()))
    }
}

/// 启动 controller 任务
///
/// 命令与 source 事件在同一个任务里消费，天然互斥；
/// 一条命令跑完（成功或回滚）之前不取下一条。
pub fn spawn(
    mut controller: AgentController,
    mut source_rx: mpsc::Receiver<SourceEvent>,
) -> ControllerHandle {
    let (tx, mut rx) = mpsc::channel::<ControllerMsg>(64);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(ControllerMsg::Command { command, reply }) => {
                            let response = controller.handle(command).await;
                            let _ = reply.send(response);
                        }
                        Some(ControllerMsg::StateProbe(reply)) => {
                            let _ = reply.send(controller.state());
                        }
                        None => break,
                    }
                }
                Some(event) = source_rx.recv() => {
                    controller.on_source_event(event).await;
                }
            }
        }

        // 所有句柄已 drop：还在追踪就收尾停掉，保证 guard 不悬挂
        if controller.state().is_running() {
            tracing::info!("controller 收尾：停止残留会话");
            controller.do_stop().await;
        }
    });

    ControllerHandle { tx }
}
