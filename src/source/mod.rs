//! LocationSource - 位置能力抽象
//!
//! 对 OS 位置 API 的能力集接口：请求权限、开/关连续更新、
//! 推送式投递 fix 与权限变化事件。
//!
//! 两个具体变体对同一接口多态，controller 不区分平台：
//! - [`PollingSource`]：定时轮询 feed（前台服务式轮询）
//! - [`WatchedSource`]：文件监听推送（delegate 回调式）
//!
//! standalone agent 中位置能力由 JSONL fix feed 文件代理：
//! feed 可读 = 权限 Granted，EACCES = Denied，feed 缺失 = SourceUnavailable。

mod poll;
#[cfg(feature = "agent")]
mod watch;

pub use poll::PollingSource;
#[cfg(feature = "agent")]
pub use watch::WatchedSource;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::error::{AgentError, Result};
use crate::types::{AccuracyHint, LocationFix, PermissionState};

/// 位置源产生的事件（推送式，不拉取）
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// 新的位置采样
    Fix(LocationFix),
    /// 权限状态变化
    Permission(PermissionState),
}

/// enable_updates 的参数
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// 距离过滤（米）：与上次上报 fix 距离不足时丢弃
    pub distance_filter_meters: f64,
    /// 精度提示
    pub accuracy: AccuracyHint,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            distance_filter_meters: 10.0,
            accuracy: AccuracyHint::Best,
        }
    }
}

/// 位置能力接口
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// 请求位置权限，返回请求后的权限状态
    async fn request_permission(&self) -> Result<PermissionState>;

    /// 开启连续更新，事件投递到 sink
    ///
    /// 失败（能力缺失等）返回 SourceUnavailable，由调用方回滚。
    async fn enable_updates(
        &self,
        options: UpdateOptions,
        sink: mpsc::Sender<SourceEvent>,
    ) -> Result<()>;

    /// 关闭连续更新
    ///
    /// 停止路径上失败会被调用方记日志后吞掉（Stop 永不卡死）。
    async fn disable_updates(&self) -> Result<()>;
}

/// 探测 feed 的权限状态（fs 访问权 = 位置权限）
pub(crate) async fn probe_permission(path: &Path) -> PermissionState {
    match tokio::fs::File::open(path).await {
        Ok(_) => PermissionState::Granted,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PermissionState::Denied,
        // feed 还没出现：能力未就绪而非被拒绝
        Err(_) => PermissionState::NotDetermined,
    }
}

/// 等距圆柱近似距离（米）
///
/// 距离过滤的尺度（几米到几十米）下误差可忽略，不需要完整 haversine。
pub(crate) fn approx_distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians() * mean_lat.cos();
    (dlat * dlat + dlon * dlon).sqrt() * EARTH_RADIUS_M
}

/// JSONL fix feed 的增量 reader
///
/// 从上次读到的字节偏移继续读新追加的完整行，解析为 [`LocationFix`]，
/// 应用距离过滤并打上单调时间戳。文件被截断/轮转时从头重读。
pub(crate) struct FixFeedReader {
    path: PathBuf,
    offset: u64,
    /// 尾部不完整行的暂存
    partial: String,
    last_emitted: Option<(f64, f64)>,
    distance_filter_meters: f64,
    epoch: Instant,
}

impl FixFeedReader {
    /// 创建 reader，从 feed 当前末尾开始（历史 fix 不补发）
    pub async fn new(path: PathBuf, distance_filter_meters: f64) -> Self {
        let offset = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            path,
            offset,
            partial: String::new(),
            last_emitted: None,
            distance_filter_meters,
            epoch: Instant::now(),
        }
    }

    /// 读取自上次以来新追加的 fix
    pub async fn poll_new(&mut self) -> Result<Vec<LocationFix>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(AgentError::PermissionDenied);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::SourceUnavailable(format!(
                    "fix feed 不存在: {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            // feed 被截断/轮转，从头重读
            tracing::debug!("fix feed 被截断，重置 offset: {}", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = String::new();
        let read = file.read_to_string(&mut buf).await?;
        self.offset += read as u64;

        if buf.is_empty() {
            return Ok(Vec::new());
        }

        self.partial.push_str(&buf);
        let mut fixes = Vec::new();

        // 只处理完整行，尾部残行留待下次
        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut fix: LocationFix = match serde_json::from_str(line) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("fix feed 行解析失败，跳过: {}", e);
                    continue;
                }
            };

            // 距离过滤
            if let Some((lat, lon)) = self.last_emitted {
                let d = approx_distance_meters(lat, lon, fix.latitude, fix.longitude);
                if d < self.distance_filter_meters {
                    tracing::trace!("fix 距离不足 {:.1}m，丢弃", d);
                    continue;
                }
            }

            fix.monotonic_ms = self.epoch.elapsed().as_millis() as u64;
            self.last_emitted = Some((fix.latitude, fix.longitude));
            fixes.push(fix);
        }

        Ok(fixes)
    }
}
