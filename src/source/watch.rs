//! 监听式位置源
//!
//! delegate 回调式变体：文件系统监听 fix feed，追加即推送，
//! 不等轮询周期。监听回调线程只做 marshal，解析在 tokio 任务里完成。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{probe_permission, FixFeedReader, LocationSource, SourceEvent, UpdateOptions};
use crate::error::{AgentError, Result};
use crate::types::PermissionState;

/// 防抖窗口：feed 写入通常成批到达
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// 基于文件监听的 LocationSource
pub struct WatchedSource {
    feed_path: PathBuf,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchedSource {
    pub fn new(feed_path: PathBuf) -> Self {
        Self {
            feed_path,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationSource for WatchedSource {
    async fn request_permission(&self) -> Result<PermissionState> {
        Ok(probe_permission(&self.feed_path).await)
    }

    async fn enable_updates(
        &self,
        options: UpdateOptions,
        sink: mpsc::Sender<SourceEvent>,
    ) -> Result<()> {
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

        let watch_dir = self
            .feed_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| {
                AgentError::SourceUnavailable(format!(
                    "fix feed 路径无父目录: {}",
                    self.feed_path.display()
                ))
            })?;

        // 监听回调 → mpsc，marshal 到 tokio 侧
        let (notify_tx, mut notify_rx) = mpsc::channel::<PathBuf>(100);
        let mut debouncer = new_debouncer(
            DEBOUNCE_WINDOW,
            move |res: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                if let Ok(events) = res {
                    for event in events {
                        if event.kind == DebouncedEventKind::Any {
                            let _ = notify_tx.blocking_send(event.path);
                        }
                    }
                }
            },
        )
        .map_err(|e| AgentError::SourceUnavailable(format!("创建监听器失败: {}", e)))?;

        // 监听父目录：部分平台直接监听文件会漏事件
        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                AgentError::SourceUnavailable(format!("监听 {} 失败: {}", watch_dir.display(), e))
            })?;

        let feed_path = self.feed_path.clone();
        let mut reader =
            FixFeedReader::new(self.feed_path.clone(), options.distance_filter_meters).await;

        let handle = tokio::spawn(async move {
            // 保持 debouncer 存活；任务被 abort 时随之释放
            let _debouncer = debouncer;

            while let Some(changed) = notify_rx.recv().await {
                if changed != feed_path {
                    continue;
                }

                match reader.poll_new().await {
                    Ok(fixes) => {
                        for fix in fixes {
                            if sink.send(SourceEvent::Fix(fix)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(AgentError::PermissionDenied) => {
                        let _ = sink
                            .send(SourceEvent::Permission(PermissionState::Denied))
                            .await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("读取 fix feed 失败: {}", e);
                    }
                }
            }
        });

        let old = self.task.lock().replace(handle);
        if let Some(old) = old {
            tracing::debug!("替换已有监听任务");
            old.abort();
        }

        tracing::info!("👁️ 监听位置源已开启: {}", self.feed_path.display());
        Ok(())
    }

    async fn disable_updates(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::info!("👁️ 监听位置源已关闭");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_watched_delivers_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        std::fs::write(&path, "").unwrap();

        let source = WatchedSource::new(path.clone());
        let (tx, mut rx) = mpsc::channel(8);
        source
            .enable_updates(
                UpdateOptions {
                    distance_filter_meters: 0.0,
                    ..Default::default()
                },
                tx,
            )
            .await
            .unwrap();

        // 给监听器一点建立时间
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            f,
            r#"{{"latitude":5.0,"longitude":6.0,"altitude":0.0,"speed":0.0,"course":0.0,"accuracy":5.0,"timestamp_ms":1706400000000}}"#
        )
        .unwrap();
        f.flush().unwrap();
        drop(f);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for fix")
            .expect("channel closed");
        match event {
            SourceEvent::Fix(fix) => assert_eq!(fix.latitude, 5.0),
            other => panic!("Expected Fix, got {:?}", other),
        }

        source.disable_updates().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_missing_feed_fails() {
        let dir = tempdir().unwrap();
        let source = WatchedSource::new(dir.path().join("absent.jsonl"));
        let (tx, _rx) = mpsc::channel(8);
        let err = source
            .enable_updates(UpdateOptions::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SourceUnavailable(_)));
    }
}
