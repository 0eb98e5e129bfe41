use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SchedulerError, SchedulerResult};

/// Worker握手时上报的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHello {
    pub name: String,
    pub concurrency: usize,
}

impl WorkerHello {
    /// 解析握手数据
    ///
    /// `name` 必须是非空字符串，`concurrency` 可以是正整数或者能解析为正整数的字符串。
    pub fn from_greeting(greeting: &Value) -> SchedulerResult<Self> {
        let name = match greeting.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            Some(other) => {
                return Err(SchedulerError::rejected(format!(
                    "握手信息中的name无效: {other}"
                )))
            }
            None => return Err(SchedulerError::rejected("握手信息缺少name字段")),
        };

        let concurrency = match greeting.get("concurrency") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            Some(_) => None,
            None => {
                return Err(SchedulerError::rejected(format!(
                    "Worker {name} 的握手信息缺少concurrency字段"
                )))
            }
        };

        match concurrency {
            Some(c) if c > 0 => Ok(Self {
                name,
                concurrency: c as usize,
            }),
            _ => Err(SchedulerError::rejected(format!(
                "Worker {name} 的concurrency不是正整数: {}",
                greeting["concurrency"]
            ))),
        }
    }

    pub fn to_greeting(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "concurrency": self.concurrency,
        })
    }
}

/// Worker在某一时刻的状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub token: u64,
    pub concurrency: usize,
    pub running: Vec<String>,
    pub exclusive: bool,
    pub registered_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }
}
