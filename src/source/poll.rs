//! 轮询式位置源
//!
//! 前台服务式变体：固定间隔轮询 fix feed，把新行作为事件推送。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::{probe_permission, FixFeedReader, LocationSource, SourceEvent, UpdateOptions};
use crate::error::{AgentError, Result};
use crate::types::PermissionState;

/// 定时轮询 feed 的 LocationSource
pub struct PollingSource {
    feed_path: PathBuf,
    poll_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingSource {
    pub fn new(feed_path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            feed_path,
            poll_interval,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationSource for PollingSource {
    async fn request_permission(&self) -> Result<PermissionState> {
        Ok(probe_permission(&self.feed_path).await)
    }

    async fn enable_updates(
        &self,
        options: UpdateOptions,
        sink: mpsc::Sender<SourceEvent>,
    ) -> Result<()> {
        // feed 必须存在且可读，否则报 SourceUnavailable / PermissionDenied
        match tokio::fs::File::open(&self.feed_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(AgentError::PermissionDenied);
            }
            Err(_) => {
                return Err(AgentError::SourceUnavailable(format!(
                    "fix feed 不存在: {}",
                    self.feed_path.display()
                )));
            }
        }

        let mut reader =
            FixFeedReader::new(self.feed_path.clone(), options.distance_filter_meters).await;
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                match reader.poll_new().await {
                    Ok(fixes) => {
                        for fix in fixes {
                            if sink.send(SourceEvent::Fix(fix)).await.is_err() {
                                return; // 接收端已关闭
                            }
                        }
                    }
                    Err(AgentError::PermissionDenied) => {
                        // feed 访问权被收回 = 位置权限被拒
                        let _ = sink
                            .send(SourceEvent::Permission(PermissionState::Denied))
                            .await;
                        return;
                    }
                    Err(e) => {
                        // feed 暂时不可用：保持轮询，等它回来
                        tracing::warn!("轮询 fix feed 失败: {}", e);
                    }
                }
            }
        });

        let old = self.task.lock().replace(handle);
        if let Some(old) = old {
            tracing::debug!("替换已有轮询任务");
            old.abort();
        }

        tracing::info!(
            "📍 轮询位置源已开启: {} (间隔 {:?})",
            self.feed_path.display(),
            poll_interval
        );
        Ok(())
    }

    async fn disable_updates(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::info!("📍 轮询位置源已关闭");
        }
        Ok(())
    }
}
