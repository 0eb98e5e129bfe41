use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use workerd_core::TaskEnv;
use workerd_rpc::{RpcError, RpcHandler, RpcResult};

use crate::executors::TaskExecutor;

/// 在Worker端处理调度器发来的调用
///
/// `run` 执行期间任务ID记录在运行集合中，`get_running` 返回该集合。
/// 连接断开导致调用被取消时，任务同样会从集合中移除。
pub struct TaskExecutionManager {
    worker_name: String,
    executor: Arc<dyn TaskExecutor>,
    running_tasks: Arc<Mutex<BTreeSet<String>>>,
}

struct RunningGuard {
    task_id: String,
    running_tasks: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running_tasks.lock() {
            running.remove(&self.task_id);
        }
    }
}

impl TaskExecutionManager {
    pub fn new(worker_name: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            worker_name: worker_name.into(),
            executor,
            running_tasks: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.running_tasks
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_task_count(&self) -> usize {
        self.running_tasks.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn track(&self, task_id: &str) -> RunningGuard {
        if let Ok(mut running) = self.running_tasks.lock() {
            running.insert(task_id.to_string());
        }
        RunningGuard {
            task_id: task_id.to_string(),
            running_tasks: Arc::clone(&self.running_tasks),
        }
    }

    async fn run(&self, args: Vec<Value>) -> RpcResult<Value> {
        let payload = args
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::remote("run 缺少任务负载参数"))?;
        let env = TaskEnv::from_value(payload).map_err(|e| RpcError::remote(e.to_string()))?;
        let task_id = env.task_id().unwrap_or_default().to_string();

        info!(worker = %self.worker_name, task_id = %task_id, "开始执行任务");
        let _guard = self.track(&task_id);

        match self.executor.execute(env).await {
            Ok(result) => {
                info!(worker = %self.worker_name, task_id = %task_id, "任务执行成功");
                Ok(result.into_value())
            }
            Err(e) => {
                warn!(worker = %self.worker_name, task_id = %task_id, "任务执行失败: {}", e);
                Err(RpcError::remote(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl RpcHandler for TaskExecutionManager {
    async fn handle(&self, method: &str, args: Vec<Value>) -> RpcResult<Value> {
        match method {
            "run" => self.run(args).await,
            "get_running" => Ok(json!(self.running_tasks())),
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}
