//! Agent 服务器
//!
//! Unix Socket 服务：接受客户端连接，把命令排进 controller 任务，
//! 把订阅的事件推回连接。PID 文件负责进程级互斥与残留检测。

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::broadcaster::{Broadcaster, ConnId};
use super::controller::{self, AgentController, Command, ControllerHandle, AGENT_VERSION};
use crate::config::{AgentConfig, SourceKind};
use crate::guard::FileLockGuard;
use crate::protocol::{QueryType, Request, Response};
use crate::source::{LocationSource, PollingSource, UpdateOptions, WatchedSource};
use crate::state::StateFlag;
use crate::types::SessionState;

/// Agent 服务
pub struct Agent {
    config: AgentConfig,
    broadcaster: Arc<Broadcaster>,
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    /// 创建 Agent
    pub fn new(config: AgentConfig) -> Result<Self> {
        // 确保数据目录存在
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        Ok(Self {
            config,
            broadcaster: Broadcaster::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 运行 Agent
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // 写入 PID 文件
        self.write_pid_file()?;

        // 上次进程如果死在追踪中，留一条提示（标志只是 hint，不自动恢复）
        let state_flag = StateFlag::new(self.config.state_path());
        let prior = state_flag.load();
        if prior.tracking {
            tracing::info!(
                "上次退出时仍在追踪 (resume_token={:?})，等待客户端决定是否恢复",
                prior.resume_token
            );
        }

        // 组装位置源与 guard，启动 controller 任务
        let source: Arc<dyn LocationSource> = match self.config.source_kind {
            SourceKind::Polling => Arc::new(PollingSource::new(
                self.config.feed_path.clone(),
                self.config.poll_interval,
            )),
            SourceKind::Watched => Arc::new(WatchedSource::new(self.config.feed_path.clone())),
        };
        let guard = Arc::new(FileLockGuard::new(self.config.guard_path()));
        let options = UpdateOptions {
            distance_filter_meters: self.config.distance_filter_meters,
            accuracy: self.config.accuracy,
        };

        let (ctrl, source_rx) = AgentController::new(
            source,
            guard,
            self.broadcaster.clone(),
            options,
            self.config.guard_timeout,
            state_flag,
        );
        let handle = controller::spawn(ctrl, source_rx);

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        // 创建 Unix Socket 监听器
        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Agent 启动: {:?}", socket_path);

        // 启动空闲检测
        let agent_for_idle = self.clone();
        let handle_for_idle = handle.clone();
        tokio::spawn(async move {
            agent_for_idle.idle_checker(handle_for_idle).await;
        });

        // 接受连接
        let mut shutdown_check = interval(Duration::from_secs(1));
        loop {
            // 只有当 shutdown 信号发出 且 没有活跃连接 时才退出
            // 这样新连接进来后可以取消退出
            if self.shutdown.load(Ordering::Relaxed) && !self.broadcaster.has_connections() {
                break;
            }

            tokio::select! {
                // 定期醒来重查 shutdown 标志：没有新连接时 accept 不会返回
                _ = shutdown_check.tick() => {}
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let agent = self.clone();
                            let handle = handle.clone();
                            tokio::spawn(async move {
                                if let Err(e) = agent.handle_connection(stream, handle).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        // 还在追踪就优雅停掉（幂等，Idle 时是 no-op）
        if let Err(e) = handle.command(Command::Stop).await {
            tracing::warn!("退出前停止会话失败: {}", e);
        }

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream, handle: ControllerHandle) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 创建消息发送通道
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // 注册连接
        let conn_id = self.broadcaster.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 启动发送任务
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 读取请求
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // 连接关闭
                    break;
                }
                Ok(_) => {
                    // 解析请求
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.broadcaster
                                .try_send_to(conn_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    // 处理请求
                    let response = self.handle_request(conn_id, request, &handle).await;
                    let resp_json = serde_json::to_string(&response)?;

                    // 发送响应
                    if !self
                        .broadcaster
                        .send_to(conn_id, format!("{}\n", resp_json))
                        .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 清理
        self.broadcaster.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 处理请求
    async fn handle_request(
        &self,
        conn_id: ConnId,
        request: Request,
        handle: &ControllerHandle,
    ) -> Response {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 握手: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Response::HandshakeOk {
                    agent_version: AGENT_VERSION.to_string(),
                }
            }

            Request::Start { resume_token } => {
                self.forward(handle, Command::Start { resume_token }).await
            }

            Request::Stop => self.forward(handle, Command::Stop).await,

            Request::IsRunning => self.forward(handle, Command::IsRunning).await,

            Request::Subscribe { events } => {
                self.broadcaster.subscribe(conn_id, events);
                Response::Ok
            }

            Request::Unsubscribe { events } => {
                self.broadcaster.unsubscribe(conn_id, events);
                Response::Ok
            }

            Request::Heartbeat => Response::Ok,

            Request::Query { query_type } => match query_type {
                QueryType::Status => {
                    let mut response = self.forward(handle, Command::Status).await;
                    // 连接数是 server 层信息，补进快照
                    if let Response::QueryResult { data } = &mut response {
                        if let Some(obj) = data.as_object_mut() {
                            obj.insert(
                                "connections".to_string(),
                                serde_json::json!(self.broadcaster.connection_count()),
                            );
                        }
                    }
                    response
                }
                QueryType::ConnectionCount => {
                    let count = self.broadcaster.connection_count();
                    Response::QueryResult {
                        data: serde_json::json!({ "count": count }),
                    }
                }
            },
        }
    }

    /// 把命令排进 controller 任务并等回复
    async fn forward(&self, handle: &ControllerHandle, command: Command) -> Response {
        match handle.command(command).await {
            Ok(response) => response,
            Err(e) => Response::Error {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }

    /// 空闲检测
    ///
    /// 追踪会话进行中绝不退出（keep-alive 的意义所在）；
    /// 只有无连接且会话 Idle 持续超时后才发 shutdown。
    async fn idle_checker(&self, handle: ControllerHandle) {
        let mut check_interval = interval(Duration::from_secs(5));
        let mut idle_count = 0u64;
        // 短超时下整除会得 0，至少要观察到一轮空闲
        let idle_threshold = (self.config.idle_timeout_secs / 5).max(1);

        // interval 的首个 tick 立即到达，不算一轮空闲
        check_interval.tick().await;

        loop {
            check_interval.tick().await;

            let session_idle = matches!(
                handle.session_state().await,
                Ok(SessionState::Idle)
            );

            if self.broadcaster.has_connections() || !session_idle {
                // 有连接或在追踪：重置状态
                idle_count = 0;
                if self.shutdown.load(Ordering::Relaxed) {
                    tracing::info!("🔄 有活动，取消退出");
                    self.shutdown.store(false, Ordering::Relaxed);
                }
            } else {
                idle_count += 1;
                if idle_count >= idle_threshold && !self.shutdown.load(Ordering::Relaxed) {
                    tracing::info!(
                        "⏰ 空闲超时 ({}s)，准备退出...",
                        self.config.idle_timeout_secs
                    );
                    self.shutdown.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        // 删除 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        // 删除 PID 文件
        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Agent 清理完成");
    }
}

/// 检查 Agent 是否正在运行
pub fn is_agent_running(config: &AgentConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    // 读取 PID
    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Agent 状态
pub fn cleanup_stale_agent(config: &AgentConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
