use std::time::Duration;

use thiserror::Error;

/// RPC层错误类型
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// 对端在执行方法时明确报告的失败
    #[error("远程错误: {0}")]
    Remote(String),

    #[error("未知方法: {0}")]
    UnknownMethod(String),

    /// 在截止时间内没有收到响应，调用已在本地放弃
    #[error("调用 {method} 超时 ({timeout:?})")]
    Timeout { method: String, timeout: Duration },

    #[error("连接已断开")]
    ConnectionLost,

    #[error("握手失败: {0}")]
    Handshake(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("IO错误: {0}")]
    Io(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    pub fn remote<S: Into<String>>(msg: S) -> Self {
        Self::Remote(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(err.to_string())
    }
}
