use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{SchedulerError, SchedulerResult};

/// 任务负载
///
/// 任务内容对调度系统是不透明的键值文档，核心只读取两个字段：
///
/// - `task_id`: 必填的字符串任务标识符
/// - `exclusive`: 可选的布尔值，表示任务是否需要独占Worker，缺省为 `true`
///
/// 其余字段原样传递给Worker，Worker执行完成后返回补充了执行结果的负载。
///
/// # 使用示例
///
/// ```rust
/// use workerd_core::models::TaskEnv;
/// use serde_json::json;
///
/// let env = TaskEnv::from_value(json!({"task_id": "ok1", "exclusive": false})).unwrap();
/// assert_eq!(env.task_id(), Some("ok1"));
/// assert!(!env.is_exclusive());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskEnv(Map<String, Value>);

impl TaskEnv {
    pub const TASK_ID: &'static str = "task_id";
    pub const EXCLUSIVE: &'static str = "exclusive";

    /// 创建只包含任务ID的负载
    pub fn new(task_id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(Self::TASK_ID.to_string(), Value::String(task_id.into()));
        Self(map)
    }

    /// 从JSON值构造负载，要求是对象
    pub fn from_value(value: Value) -> SchedulerResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SchedulerError::invalid_params(format!(
                "任务负载必须是JSON对象，实际为: {other}"
            ))),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.0.get(Self::TASK_ID).and_then(Value::as_str)
    }

    /// 获取任务ID，缺失时返回参数错误
    pub fn require_task_id(&self) -> SchedulerResult<&str> {
        self.task_id()
            .ok_or_else(|| SchedulerError::invalid_params("任务负载缺少字符串字段 task_id"))
    }

    /// 是否独占Worker，只有显式的 `false` 才表示非独占
    pub fn is_exclusive(&self) -> bool {
        self.0
            .get(Self::EXCLUSIVE)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.0
            .insert(Self::EXCLUSIVE.to_string(), Value::Bool(exclusive));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn to_json_string(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn from_json_str(s: &str) -> SchedulerResult<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }
}

impl From<Map<String, Value>> for TaskEnv {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// 任务状态
///
/// ```text
/// Pending → Running → Done | Failed
///              ↓
///           Pending (Worker断开后重新排队)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// 执行中的任务记录，由任务管理器持有
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub env: TaskEnv,
    pub state: TaskState,
    pub worker: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, env: TaskEnv) -> Self {
        Self {
            task_id: task_id.into(),
            env,
            state: TaskState::Pending,
            worker: None,
            submitted_at: Utc::now(),
        }
    }
}

/// 持久化的任务行
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: String,
    pub env: TaskEnv,
}

/// 调度队列中的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: String,
    pub exclusive: bool,
}

impl QueueEntry {
    pub fn new(task_id: impl Into<String>, exclusive: bool) -> Self {
        Self {
            task_id: task_id.into(),
            exclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exclusive_defaults_to_true() {
        let env = TaskEnv::new("t1");
        assert!(env.is_exclusive());

        let env = TaskEnv::from_value(json!({"task_id": "t1", "exclusive": "no"})).unwrap();
        assert!(env.is_exclusive());

        let env = TaskEnv::new("t1").with_exclusive(false);
        assert!(!env.is_exclusive());
    }

    #[test]
    fn test_require_task_id() {
        let env = TaskEnv::from_value(json!({"foo": "bar"})).unwrap();
        assert!(env.task_id().is_none());
        assert!(matches!(
            env.require_task_id(),
            Err(SchedulerError::InvalidTaskParams(_))
        ));

        let env = TaskEnv::from_value(json!({"task_id": 42})).unwrap();
        assert!(env.require_task_id().is_err());
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert!(TaskEnv::from_value(json!(["task_id"])).is_err());
        assert!(TaskEnv::from_value(json!("asdf")).is_err());
    }

    #[test]
    fn test_json_string_preserves_unknown_fields() {
        let env = TaskEnv::from_json_str(r#"{"task_id": "asdf", "nested": {"a": [1, 2]}}"#).unwrap();
        let restored = TaskEnv::from_json_str(&env.to_json_string().unwrap()).unwrap();
        assert_eq!(restored, env);
        assert_eq!(restored.get("nested"), Some(&json!({"a": [1, 2]})));
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
