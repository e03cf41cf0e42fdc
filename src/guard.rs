//! LifecycleGuard - keep-alive token
//!
//! 追踪会话期间保持宿主进程存活的 OS 级机制的抽象。
//! token 由 AgentController 独占持有，Start/Stop 与位置源开关成对获取/释放。
//!
//! 约束：
//! - 释放后必须可重新获取（无永久耗尽）
//! - release 幂等：重复释放是 no-op，不是错误（防 Start/Stop 回滚路径 double-free）

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// keep-alive token（不透明，独占所有权）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardToken {
    id: Uuid,
}

impl GuardToken {
    /// 铸造新 token（guard 实现方用）
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for GuardToken {
    fn default() -> Self {
        Self::new()
    }
}

/// keep-alive 能力接口
#[async_trait]
pub trait LifecycleGuard: Send + Sync {
    /// 获取 keep-alive token（可能是阻塞型 OS 调用）
    async fn acquire(&self) -> Result<GuardToken>;

    /// 释放 token（幂等：陈旧或重复的 token 静默忽略）
    async fn release(&self, token: GuardToken);
}

/// lock 文件内容
#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    pid: u32,
    token: Uuid,
}

/// 基于 lock 文件的 LifecycleGuard
///
/// lock 文件携带 pid + token id；持有者进程死亡后文件视为残留，可被接管。
/// 单机语义足够：guard 的目的是"会话期间不被收割"，不是分布式互斥。
pub struct FileLockGuard {
    path: PathBuf,
    current: Mutex<Option<Uuid>>,
}

impl FileLockGuard {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }

    /// 检查 lock 文件指向的进程是否存活
    fn holder_alive(body: &LockBody) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(body.pid as i32, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            // 非 unix 平台无廉价探活，保守认为存活
            let _ = body;
            true
        }
    }
}

#[async_trait]
impl LifecycleGuard for FileLockGuard {
    async fn acquire(&self) -> Result<GuardToken> {
        if self.current.lock().is_some() {
            return Err(AgentError::GuardAcquisitionFailed(
                "token 已被当前会话持有".to_string(),
            ));
        }

        let my_pid = std::process::id();

        // 已有 lock 文件：持有者存活则拒绝，残留则接管
        if let Ok(content) = tokio::fs::read_to_string(&self.path).await {
            match serde_json::from_str::<LockBody>(&content) {
                Ok(body) if body.pid != my_pid && Self::holder_alive(&body) => {
                    return Err(AgentError::GuardAcquisitionFailed(format!(
                        "lock 被进程 {} 持有",
                        body.pid
                    )));
                }
                Ok(body) => {
                    tracing::debug!("接管残留 lock: pid={}", body.pid);
                }
                Err(e) => {
                    tracing::debug!("lock 文件损坏，接管: {}", e);
                }
            }
        }

        let token = GuardToken::new();
        let body = LockBody {
            pid: my_pid,
            token: token.id,
        };
        tokio::fs::write(&self.path, serde_json::to_string(&body)?).await?;

        *self.current.lock() = Some(token.id);
        tracing::debug!("keep-alive token 已获取: {}", token.id);
        Ok(token)
    }

    async fn release(&self, token: GuardToken) {
        {
            let mut current = self.current.lock();
            if *current != Some(token.id) {
                // 陈旧 token：no-op
                tracing::debug!("忽略陈旧 token 释放: {}", token.id);
                return;
            }
            *current = None;
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("删除 lock 文件失败: {}", e);
            }
        }
        tracing::debug!("keep-alive token 已释放: {}", token.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_acquire_release_reacquire() {
        let dir = tempdir().unwrap();
        let guard = FileLockGuard::new(dir.path().join("tracking.lock"));

        let token = guard.acquire().await.unwrap();
        guard.release(token).await;

        // 释放后必须可重新获取
        let token2 = guard.acquire().await.unwrap();
        guard.release(token2).await;
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let dir = tempdir().unwrap();
        let guard = FileLockGuard::new(dir.path().join("tracking.lock"));

        let token = guard.acquire().await.unwrap();
        guard.release(token.clone()).await;
        // 第二次释放同一 token：no-op，不 panic、不报错
        guard.release(token).await;

        assert!(guard.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_while_held_fails() {
        let dir = tempdir().unwrap();
        let guard = FileLockGuard::new(dir.path().join("tracking.lock"));

        let _token = guard.acquire().await.unwrap();
        let err = guard.acquire().await.unwrap_err();
        assert!(matches!(err, AgentError::GuardAcquisitionFailed(_)));
    }

    #[tokio::test]
    async fn test_stale_lock_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.lock");

        // 写一个不可能存活的 pid 的残留 lock（远超 pid_max）
        let stale = LockBody {
            pid: 999_999_999,
            token: Uuid::new_v4(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = FileLockGuard::new(&path);
        assert!(guard.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_lock_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.lock");
        std::fs::write(&path, "not json").unwrap();

        let guard = FileLockGuard::new(&path);
        assert!(guard.acquire().await.is_ok());
    }
}
