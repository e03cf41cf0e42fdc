//! Agent 配置

use std::path::PathBuf;
use std::time::Duration;

use crate::types::AccuracyHint;

/// 位置源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// 定时轮询 feed（前台服务式轮询变体）
    Polling,
    /// 文件监听 feed（delegate 回调式推送变体）
    Watched,
}

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 数据目录（默认 ~/.tracking-agent）
    pub data_dir: PathBuf,
    /// 位置 feed 文件（JSONL，每行一个 fix）
    pub feed_path: PathBuf,
    /// 位置源变体
    pub source_kind: SourceKind,
    /// 距离过滤（米）：与上一条已上报 fix 距离小于该值的 fix 丢弃
    pub distance_filter_meters: f64,
    /// 精度提示
    pub accuracy: AccuracyHint,
    /// 轮询间隔（Polling 变体）
    pub poll_interval: Duration,
    /// guard 获取超时（超时视为 Start 失败并回滚）
    pub guard_timeout: Duration,
    /// 空闲超时（秒）：无连接且会话 Idle 持续该时长后退出
    pub idle_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = match std::env::var("TRACKING_AGENT_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tracking-agent"),
        };

        let feed_path = std::env::var("TRACKING_FIX_FEED")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("fix-feed.jsonl"));

        Self {
            data_dir,
            feed_path,
            source_kind: SourceKind::Watched,
            // 原始外部契约：每 10 米上报一次
            distance_filter_meters: 10.0,
            accuracy: AccuracyHint::Best,
            poll_interval: Duration::from_secs(1),
            guard_timeout: Duration::from_secs(5),
            idle_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }

    /// keep-alive lock 文件路径
    pub fn guard_path(&self) -> PathBuf {
        self.data_dir.join("tracking.lock")
    }

    /// 持久化 liveness 标志路径
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("tracking.state")
    }
}
