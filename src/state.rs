//! 持久化 liveness 标志
//!
//! 一个布尔标志（"当前是否认为在追踪"），Start/Stop 时写入，状态查询时读取。
//! 仅作为跨进程重启的 best-effort 提示，不权威：落盘失败只记日志，不影响会话。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 标志文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingFlag {
    /// 是否在追踪
    pub tracking: bool,
    /// 当前会话的 resume token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// 最后写入时间（Unix 毫秒）
    pub updated_at_ms: i64,
}

impl Default for TrackingFlag {
    fn default() -> Self {
        Self {
            tracking: false,
            resume_token: None,
            updated_at_ms: 0,
        }
    }
}

/// liveness 标志的读写句柄
#[derive(Debug, Clone)]
pub struct StateFlag {
    path: PathBuf,
}

impl StateFlag {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取标志（缺失或损坏一律按默认值处理）
    pub fn load(&self) -> TrackingFlag {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(flag) => flag,
                Err(e) => {
                    tracing::warn!("liveness 标志损坏，按未追踪处理: {}", e);
                    TrackingFlag::default()
                }
            },
            Err(_) => TrackingFlag::default(),
        }
    }

    /// 写入标志（best-effort：失败只记日志）
    pub fn store(&self, tracking: bool, resume_token: Option<&str>) {
        let flag = TrackingFlag {
            tracking,
            resume_token: resume_token.map(|s| s.to_string()),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let result = serde_json::to_string(&flag)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&self.path, json));

        if let Err(e) = result {
            tracing::warn!("写入 liveness 标志失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_defaults_to_not_tracking() {
        let dir = tempdir().unwrap();
        let flag = StateFlag::new(dir.path().join("tracking.state"));
        assert!(!flag.load().tracking);
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempdir().unwrap();
        let flag = StateFlag::new(dir.path().join("tracking.state"));

        flag.store(true, Some("trip-7"));
        let loaded = flag.load();
        assert!(loaded.tracking);
        assert_eq!(loaded.resume_token.as_deref(), Some("trip-7"));
        assert!(loaded.updated_at_ms > 0);

        flag.store(false, None);
        let loaded = flag.load();
        assert!(!loaded.tracking);
        assert!(loaded.resume_token.is_none());
    }

    #[test]
    fn test_load_corrupt_defaults_to_not_tracking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.state");
        std::fs::write(&path, "not json").unwrap();

        let flag = StateFlag::new(path);
        assert!(!flag.load().tracking);
    }
}
