//! 错误类型定义

use thiserror::Error;

use crate::types::ErrorKind;

/// Agent 错误类型
#[derive(Error, Debug)]
pub enum AgentError {
    /// 位置权限被拒绝（用户拒绝，不自动重试）
    #[error("位置权限被拒绝")]
    PermissionDenied,

    /// keep-alive token 获取失败（Start 失败，不保留部分状态）
    #[error("keep-alive token 获取失败: {0}")]
    GuardAcquisitionFailed(String),

    /// 底层位置能力缺失或不可用
    #[error("位置源不可用: {0}")]
    SourceUnavailable(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 通道错误（controller 任务已退出等）
    #[error("通道错误: {0}")]
    Channel(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// wire 层错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::PermissionDenied => ErrorKind::PermissionDenied,
            AgentError::GuardAcquisitionFailed(_) => ErrorKind::GuardAcquisitionFailed,
            AgentError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// wire 层错误码
    pub fn code(&self) -> i32 {
        match self {
            AgentError::PermissionDenied => 403,
            AgentError::GuardAcquisitionFailed(_) | AgentError::SourceUnavailable(_) => 503,
            _ => 500,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, AgentError>;
