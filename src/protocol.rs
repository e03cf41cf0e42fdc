//! IPC 协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 每条 `Request` 恰好对应一条 `Response`（逻辑请求 exactly-once；
//! 重试的 Start/Stop 命中幂等 no-op，不会产生二次副作用）。
//! `Push` 是 fire-and-forget 通知，只发给订阅了对应 `EventType` 的连接。

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, LocationFix, PermissionState, SessionState};

/// 请求类型（Client → Agent）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 组件名称（控制端标识，日志和诊断用）
        component: String,
        /// 组件版本
        version: String,
    },

    /// 开始追踪
    ///
    /// resume_token 可选：跨进程重启恢复会话时带上；
    /// 缺省时由 agent 生成并在 ServiceStarted 中回传。
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },

    /// 停止追踪
    Stop,

    /// 查询是否在追踪
    IsRunning,

    /// 订阅事件
    Subscribe {
        /// 要订阅的事件类型
        events: Vec<EventType>,
    },

    /// 取消订阅
    Unsubscribe {
        /// 要取消的事件类型
        events: Vec<EventType>,
    },

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询
    Query {
        /// 查询类型
        query_type: QueryType,
    },
}

/// 响应类型（Agent → Client）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Agent 版本
        agent_version: String,
    },

    /// IsRunning 结果
    Running { running: bool },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

/// 推送事件（Agent → 订阅者）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    /// 追踪会话已启动
    ServiceStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },

    /// 追踪会话已停止
    ServiceStopped,

    /// 位置更新
    LocationUpdate(LocationFix),

    /// 权限状态变化
    PermissionChanged { state: PermissionState },

    /// 错误通知（Start 回滚等，agent 本身仍可用）
    Error { kind: ErrorKind, message: String },
}

/// 事件类型（用于订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// 会话生命周期（ServiceStarted / ServiceStopped）
    Lifecycle,
    /// 位置更新
    Location,
    /// 权限变化
    Permission,
    /// 错误通知
    Error,
}

/// 查询类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Agent 状态（会话状态 + 持久化 liveness 标志 + 连接数）
    Status,
    /// 获取连接数
    ConnectionCount,
}

/// 事件（内部使用，用于广播）
#[derive(Debug, Clone)]
pub enum Event {
    Started { resume_token: Option<String> },
    Stopped,
    Location(LocationFix),
    Permission(PermissionState),
    Error { kind: ErrorKind, message: String },
}

impl Event {
    /// 获取事件类型
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Started { .. } | Event::Stopped => EventType::Lifecycle,
            Event::Location(_) => EventType::Location,
            Event::Permission(_) => EventType::Permission,
            Event::Error { .. } => EventType::Error,
        }
    }

    /// 转换为 Push 消息
    pub fn to_push(&self) -> Push {
        match self {
            Event::Started { resume_token } => Push::ServiceStarted {
                resume_token: resume_token.clone(),
            },
            Event::Stopped => Push::ServiceStopped,
            Event::Location(fix) => Push::LocationUpdate(fix.clone()),
            Event::Permission(state) => Push::PermissionChanged { state: *state },
            Event::Error { kind, message } => Push::Error {
                kind: *kind,
                message: message.clone(),
            },
        }
    }
}

/// Agent 状态快照（Query::Status 的返回体）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Agent 版本
    pub agent_version: String,
    /// 当前会话状态
    pub session_state: SessionState,
    /// 当前权限状态
    pub permission: PermissionState,
    /// 持久化 liveness 标志（best-effort，跨重启提示，不权威）
    pub tracking_flag: bool,
    /// 当前 resume token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_start_serialize() {
        let request = Request::Start { resume_token: None };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"Start\""));
        // 可选字段应被跳过
        assert!(!json.contains("resume_token"));

        let request = Request::Start {
            resume_token: Some("trip-42".to_string()),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"resume_token\":\"trip-42\""));
    }

    #[test]
    fn test_request_deserialize_plain_commands() {
        let request: Request = serde_json::from_str(r#"{"type":"Stop"}"#).unwrap();
        assert!(matches!(request, Request::Stop));

        let request: Request = serde_json::from_str(r#"{"type":"IsRunning"}"#).unwrap();
        assert!(matches!(request, Request::IsRunning));

        let request: Request = serde_json::from_str(r#"{"type":"Start"}"#).unwrap();
        match request {
            Request::Start { resume_token } => assert!(resume_token.is_none()),
            _ => panic!("Expected Start"),
        }
    }

    #[test]
    fn test_push_location_update_wire_format() {
        let fix = LocationFix {
            latitude: 1.0,
            longitude: 2.0,
            altitude: 100.0,
            speed: 12.5,
            bearing: 180.0,
            accuracy: 8.0,
            timestamp_ms: 1706400000000,
            monotonic_ms: 500,
        };

        let push = Push::LocationUpdate(fix);
        let json = serde_json::to_string(&push).unwrap();

        assert!(json.contains("\"type\":\"LocationUpdate\""));
        assert!(json.contains("\"latitude\":1.0"));
        assert!(json.contains("\"course\":180.0"));
        assert!(json.contains("\"timestamp_ms\":1706400000000"));
    }

    #[test]
    fn test_event_type_mapping() {
        assert_eq!(
            Event::Started { resume_token: None }.event_type(),
            EventType::Lifecycle
        );
        assert_eq!(Event::Stopped.event_type(), EventType::Lifecycle);
        assert_eq!(
            Event::Permission(PermissionState::Denied).event_type(),
            EventType::Permission
        );
        assert_eq!(
            Event::Error {
                kind: ErrorKind::GuardAcquisitionFailed,
                message: "timeout".to_string(),
            }
            .event_type(),
            EventType::Error
        );
    }

    #[test]
    fn test_event_to_push_roundtrip() {
        let event = Event::Started {
            resume_token: Some("abc".to_string()),
        };
        match event.to_push() {
            Push::ServiceStarted { resume_token } => {
                assert_eq!(resume_token.as_deref(), Some("abc"));
            }
            _ => panic!("Expected ServiceStarted"),
        }

        let event = Event::Permission(PermissionState::Denied);
        let json = serde_json::to_string(&event.to_push()).unwrap();
        assert!(json.contains("\"type\":\"PermissionChanged\""));
        assert!(json.contains("\"Denied\""));
    }

    #[test]
    fn test_push_error_kind_snake_case() {
        let push = Push::Error {
            kind: ErrorKind::GuardAcquisitionFailed,
            message: "lock held by pid 42".to_string(),
        };
        let json = serde_json::to_string(&push).unwrap();
        assert!(json.contains("\"kind\":\"guard_acquisition_failed\""));
    }

    #[test]
    fn test_subscribe_event_types() {
        let request = Request::Subscribe {
            events: vec![EventType::Location, EventType::Lifecycle],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"Location\""));
        assert!(json.contains("\"Lifecycle\""));
    }

    #[test]
    fn test_response_running() {
        let response = Response::Running { running: true };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"running\":true"));

        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Running { running } => assert!(running),
            _ => panic!("Expected Running"),
        }
    }

    #[test]
    fn test_request_deserialize_unknown_type_fails() {
        // 未知命令应解析失败，由 server 回 400
        let result = serde_json::from_str::<Request>(r#"{"type":"Reboot"}"#);
        assert!(result.is_err());
    }
}
