//! Agent Client 连接逻辑
//!
//! 连接或启动 Agent，并把 socket 上的 JSONL 消息分流成
//! 响应（一问一答）与推送（订阅事件）两路。

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::protocol::{EventType, Push, Request, Response};

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.tracking-agent）
    pub data_dir: PathBuf,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// Agent 二进制路径覆盖（优先于默认路径）
    pub agent_binary_override: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = match std::env::var("TRACKING_AGENT_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tracking-agent"),
        };

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
            agent_binary_override: None,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// 设置 Agent 二进制路径
    pub fn with_agent_binary(mut self, path: PathBuf) -> Self {
        self.agent_binary_override = Some(path);
        self
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }

    /// Agent 二进制默认路径
    pub fn default_agent_binary_path(&self) -> PathBuf {
        self.data_dir.join("bin").join("tracking-agent")
    }

    /// 查找 Agent 二进制
    ///
    /// 查找顺序：
    /// 1. agent_binary_override（配置覆盖）
    /// 2. TRACKING_AGENT_PATH 环境变量
    /// 3. ~/.tracking-agent/bin/tracking-agent（默认安装路径）
    /// 4. Cargo target 目录（开发阶段）
    pub fn find_agent_binary(&self) -> Option<PathBuf> {
        // 1. 配置覆盖
        if let Some(ref path) = self.agent_binary_override {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // 2. 环境变量
        if let Ok(path) = std::env::var("TRACKING_AGENT_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 3. 默认安装路径
        let default_path = self.default_agent_binary_path();
        if default_path.exists() {
            return Some(default_path);
        }

        // 4. Cargo target 目录
        for profile in ["release", "debug"] {
            let cargo_path = PathBuf::from(format!("target/{}/tracking-agent", profile));
            if cargo_path.exists() {
                return Some(cargo_path);
            }

            if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
                let path = PathBuf::from(&manifest_dir).join(format!("target/{}/tracking-agent", profile));
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// 一条从 socket 读上来的消息：响应或推送
///
/// 两个 enum 的 tag 有一处撞车（Error），用字段区分：
/// Push::Error 带 kind，Response::Error 带 code。
fn classify(line: &str) -> Option<Message> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let tag = value.get("type")?.as_str()?;

    let is_push = matches!(
        tag,
        "ServiceStarted" | "ServiceStopped" | "LocationUpdate" | "PermissionChanged"
    ) || (tag == "Error" && value.get("kind").is_some());

    if is_push {
        serde_json::from_value(value).ok().map(Message::Push)
    } else {
        serde_json::from_value(value).ok().map(Message::Response)
    }
}

enum Message {
    Response(Response),
    Push(Push),
}

/// Agent Client
pub struct AgentClient {
    #[allow(dead_code)]
    config: ClientConfig,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 响应接收通道（一问一答）
    resp_rx: mpsc::Receiver<Response>,
    /// 推送事件接收通道
    push_rx: mpsc::Receiver<Push>,
}

impl AgentClient {
    /// 发送请求并等待响应
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)?;
        self.writer
            .write_all(format!("{}\n", request_json).as_bytes())
            .await?;

        self.resp_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))
    }

    /// 开始追踪
    pub async fn start(&mut self, resume_token: Option<String>) -> Result<()> {
        let response = self.request(&Request::Start { resume_token }).await?;
        expect_ok(response, "Start")
    }

    /// 停止追踪（重试安全：已停止时命中幂等 no-op）
    pub async fn stop(&mut self) -> Result<()> {
        let response = self.request(&Request::Stop).await?;
        expect_ok(response, "Stop")
    }

    /// 查询是否在追踪
    pub async fn is_running(&mut self) -> Result<bool> {
        match self.request(&Request::IsRunning).await? {
            Response::Running { running } => Ok(running),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("IsRunning failed: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// 订阅事件
    pub async fn subscribe(&mut self, events: Vec<EventType>) -> Result<()> {
        let response = self.request(&Request::Subscribe { events }).await?;
        expect_ok(response, "Subscribe")
    }

    /// 接收推送事件
    pub async fn recv_push(&mut self) -> Option<Push> {
        self.push_rx.recv().await
    }

    /// 获取推送接收器（用于 select!）
    pub fn push_receiver(&mut self) -> &mut mpsc::Receiver<Push> {
        &mut self.push_rx
    }
}

fn expect_ok(response: Response, what: &str) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        Response::Error { code, message } => {
            Err(anyhow::anyhow!("{} failed: {} (code={})", what, message, code))
        }
        _ => Err(anyhow::anyhow!("Unexpected response to {}", what)),
    }
}

/// 连接或启动 Agent
///
/// 连接流程：
/// 1. 尝试连接 socket（重试 3 次，间隔 500ms）
/// 2. 连接失败 → 检查残留状态
/// 3. 清理残留 → 启动 Agent
/// 4. 等待 Agent ready → 连接
pub async fn connect_or_start_agent(config: ClientConfig) -> Result<AgentClient> {
    let socket_path = config.socket_path();

    // 1. 尝试连接（重试）
    for attempt in 1..=config.connect_retries {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                tracing::debug!("连接 Agent 成功 (attempt={})", attempt);
                return finish_connect(config, stream).await;
            }
            Err(e) => {
                tracing::debug!("连接 Agent 失败 (attempt={}): {}", attempt, e);
                if attempt < config.connect_retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    // 2. 检查残留状态
    if is_agent_stuck(&config) {
        tracing::warn!("检测到 Agent 卡死，清理残留状态...");
        cleanup_stale(&config)?;
    }

    // 3. 启动 Agent
    start_agent(&config)?;

    // 4. 等待 Agent ready 并连接
    for attempt in 1..=10 {
        sleep(Duration::from_millis(200)).await;

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            tracing::info!("Agent 启动成功，已连接");
            return finish_connect(config, stream).await;
        }

        tracing::debug!("等待 Agent ready (attempt={})", attempt);
    }

    Err(anyhow::anyhow!("启动 Agent 超时"))
}

/// 完成连接（握手 + 启动分流读取任务）
async fn finish_connect(config: ClientConfig, stream: UnixStream) -> Result<AgentClient> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送握手
    let handshake = Request::Handshake {
        component: config.component.clone(),
        version: config.version.clone(),
    };
    let handshake_json = serde_json::to_string(&handshake)?;
    writer
        .write_all(format!("{}\n", handshake_json).as_bytes())
        .await?;

    // 读取握手响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Response = serde_json::from_str(&line)?;
    match response {
        Response::HandshakeOk { agent_version } => {
            tracing::info!("握手成功: agent_version={}", agent_version);
        }
        Response::Error { code, message } => {
            return Err(anyhow::anyhow!("握手失败: {} (code={})", message, code));
        }
        _ => {
            return Err(anyhow::anyhow!("握手响应异常"));
        }
    }

    // 响应与推送分流
    let (resp_tx, resp_rx) = mpsc::channel(16);
    let (push_tx, push_rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => match classify(line.trim()) {
                    Some(Message::Response(resp)) => {
                        if resp_tx.send(resp).await.is_err() {
                            break;
                        }
                    }
                    Some(Message::Push(push)) => {
                        // 推送积压时丢弃（fire-and-forget 语义）
                        let _ = push_tx.try_send(push);
                    }
                    None => {
                        tracing::warn!("无法解析的消息: {}", line.trim());
                    }
                },
                Err(_) => break,
            }
        }
    });

    Ok(AgentClient {
        config,
        writer,
        resp_rx,
        push_rx,
    })
}

/// 检查 Agent 是否卡死
fn is_agent_stuck(config: &ClientConfig) -> bool {
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
    let process_alive = unsafe { libc::kill(pid, 0) == 0 };

    // 如果进程存在但 socket 连接失败，认为是卡死
    process_alive && !config.socket_path().exists()
}

/// 清理残留状态
fn cleanup_stale(config: &ClientConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    // 尝试杀死旧进程
    if pid_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_str.trim().parse::<i32>() {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                tracing::debug!("杀死残留 Agent 进程: pid={}", pid);
            }
        }
    }

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
    }

    Ok(())
}

/// 启动 Agent
fn start_agent(config: &ClientConfig) -> Result<()> {
    let agent_path = config.find_agent_binary().ok_or_else(|| {
        anyhow::anyhow!(
            "找不到 Agent 二进制。\n\
             尝试过的路径：\n\
             - 配置覆盖: {:?}\n\
             - 环境变量 TRACKING_AGENT_PATH: {:?}\n\
             - 默认路径: {:?}\n\
             - Cargo target 目录\n\
             \n\
             请设置 TRACKING_AGENT_PATH 环境变量，或运行 `cargo build --features agent --bin tracking-agent`",
            config.agent_binary_override,
            std::env::var("TRACKING_AGENT_PATH").ok(),
            config.default_agent_binary_path()
        )
    })?;

    tracing::info!("启动 Agent: {:?}", agent_path);

    Command::new(&agent_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("启动 Agent 失败")?;

    Ok(())
}
