use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    /// Worker握手信息不合法，或者Worker处于无法接受的状态
    #[error("Worker被拒绝: {0}")]
    WorkerRejected(String),

    #[error("Worker名称重复: {name}")]
    DuplicateWorker { name: String },

    /// 执行任务期间Worker连接断开
    #[error("Worker已断开: {name}")]
    WorkerGone { name: String },

    /// Worker在执行任务时明确报告的失败
    #[error("远程执行错误: {0}")]
    RemoteError(String),

    #[error("任务执行超时: {task_id} ({after_ms}毫秒)")]
    Timeout { task_id: String, after_ms: u64 },

    /// 向没有足够容量的Worker分发任务，属于调用方的编程错误
    #[error("Worker容量不足: {0}")]
    CapacityViolation(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("任务已在执行中: {id}")]
    DuplicateTask { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("系统正在关闭")]
    ShuttingDown,

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Self::WorkerRejected(msg.into())
    }
    pub fn worker_gone<S: Into<String>>(name: S) -> Self {
        Self::WorkerGone { name: name.into() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 任务的最终结果：提交者只会看到成功、远程错误或超时
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerError::RemoteError(_) | SchedulerError::Timeout { .. }
        )
    }

    /// Worker掉线导致的失败，调度器会把任务重新放回队列
    pub fn is_worker_gone(&self) -> bool {
        matches!(self, SchedulerError::WorkerGone { .. })
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::DatabaseOperation(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(SchedulerError::RemoteError("boom".to_string()).is_terminal());
        assert!(SchedulerError::Timeout {
            task_id: "t".to_string(),
            after_ms: 250
        }
        .is_terminal());
        assert!(!SchedulerError::worker_gone("w1").is_terminal());
        assert!(SchedulerError::worker_gone("w1").is_worker_gone());
        assert!(!SchedulerError::ShuttingDown.is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::DuplicateWorker {
            name: "w1".to_string(),
        };
        assert!(err.to_string().contains("w1"));

        let err = SchedulerError::Timeout {
            task_id: "t".to_string(),
            after_ms: 250,
        };
        assert!(err.to_string().contains("250毫秒"));

        let err = SchedulerError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
