//! 领域类型定义
//!
//! 会话状态、权限状态、位置 Fix 等核心值类型。

use serde::{Deserialize, Serialize};

/// 会话状态
///
/// 进程内只有一个实例，由 AgentController 持有。
/// 状态只能通过 controller 的命令处理路径变更。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// 空闲（未追踪）
    Idle,
    /// 启动中（获取 guard token + 开启 source 的过渡态）
    Starting,
    /// 追踪中
    Active,
    /// 停止中（过渡态）
    Stopping,
}

impl SessionState {
    /// 是否处于追踪态（含启动过渡态，Start 幂等判断用）
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Starting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// 位置权限状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionState {
    /// 未决定（尚未请求过）
    NotDetermined,
    /// 已授权
    Granted,
    /// 已拒绝
    Denied,
}

/// 精度提示（传给 LocationSource，具体含义由 source 实现解释）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyHint {
    /// 最高精度（导航级）
    Best,
    /// 平衡精度/功耗
    Balanced,
    /// 低精度
    Low,
}

impl Default for AccuracyHint {
    fn default() -> Self {
        AccuracyHint::Best
    }
}

/// 单个位置采样
///
/// 不可变值：由 LocationSource 产生，controller 消费一次后转发，不保留。
/// 字段命名对齐外部契约（course = 航向，accuracy = 水平精度）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// 纬度（度）
    pub latitude: f64,
    /// 经度（度）
    pub longitude: f64,
    /// 海拔（米）
    pub altitude: f64,
    /// 速度（米/秒，未知为负）
    pub speed: f64,
    /// 航向（度，正北为 0，未知为负）
    #[serde(rename = "course")]
    pub bearing: f64,
    /// 水平精度（米）
    pub accuracy: f64,
    /// 墙钟时间戳（Unix 毫秒）
    pub timestamp_ms: i64,
    /// 单调时间戳（agent 启动起算的毫秒，跨 fix 可比较，重启后归零）
    #[serde(default)]
    pub monotonic_ms: u64,
}

/// 错误种类（wire 层用，对应 AgentError 的分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    GuardAcquisitionFailed,
    SourceUnavailable,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_is_running() {
        assert!(!SessionState::Idle.is_running());
        assert!(SessionState::Starting.is_running());
        assert!(SessionState::Active.is_running());
        assert!(!SessionState::Stopping.is_running());
    }

    #[test]
    fn test_location_fix_wire_field_names() {
        let fix = LocationFix {
            latitude: 1.0,
            longitude: 2.0,
            altitude: 30.0,
            speed: 5.0,
            bearing: 90.0,
            accuracy: 10.0,
            timestamp_ms: 1706400000000,
            monotonic_ms: 1234,
        };

        let json = serde_json::to_string(&fix).unwrap();
        // 外部契约字段名：course / accuracy / timestamp_ms
        assert!(json.contains("\"course\":90.0"));
        assert!(json.contains("\"accuracy\":10.0"));
        assert!(json.contains("\"timestamp_ms\":1706400000000"));
        assert!(!json.contains("bearing"));
    }

    #[test]
    fn test_location_fix_monotonic_defaults() {
        // 外部 feed 可以不带 monotonic_ms
        let json = r#"{
            "latitude": 1.0, "longitude": 2.0, "altitude": 0.0,
            "speed": 0.0, "course": 0.0, "accuracy": 5.0,
            "timestamp_ms": 1706400000000
        }"#;
        let fix: LocationFix = serde_json::from_str(json).unwrap();
        assert_eq!(fix.monotonic_ms, 0);
    }
}
