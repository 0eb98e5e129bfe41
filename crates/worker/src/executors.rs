use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use workerd_core::{SchedulerError, SchedulerResult, TaskEnv};

/// 任务执行器
///
/// 接收调度器分发的任务负载，返回补充了执行结果的负载。返回错误时调度端
/// 收到远程错误，任务不会重试。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, env: TaskEnv) -> SchedulerResult<TaskEnv>;
}

/// Shell任务参数，从任务负载中读取
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    /// 命令参数
    pub args: Option<Vec<String>>,
    /// 工作目录
    pub working_dir: Option<String>,
    /// 环境变量
    pub env_vars: Option<HashMap<String, String>>,
}

impl ShellTaskParams {
    pub fn from_env(env: &TaskEnv) -> SchedulerResult<Self> {
        serde_json::from_value(Value::Object(env.as_map().clone()))
            .map_err(|e| SchedulerError::invalid_params(format!("解析Shell任务参数失败: {e}")))
    }
}

/// Shell任务执行器
///
/// 执行结果以 `stdout`、`stderr`、`exit_code` 写入负载的 `result` 字段，
/// 退出码非零视为执行失败。
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, mut env: TaskEnv) -> SchedulerResult<TaskEnv> {
        let start_time = Instant::now();
        let task_id = env.task_id().unwrap_or_default().to_string();
        let params = ShellTaskParams::from_env(&env)?;
        let args = params.args.unwrap_or_default();

        info!(task_id = %task_id, "执行Shell任务: command={}, args={:?}", params.command, args);

        let mut cmd = Command::new(&params.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in params.env_vars.unwrap_or_default() {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| SchedulerError::RemoteError(format!("启动Shell命令失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();
        let duration_ms = start_time.elapsed().as_millis() as u64;

        if !output.status.success() {
            warn!(
                task_id = %task_id,
                "Shell任务失败: exit_code={:?}, duration={}ms",
                exit_code,
                duration_ms
            );
            let reason = if stderr.is_empty() {
                format!("命令执行失败，退出码: {exit_code:?}")
            } else {
                format!("命令执行失败，退出码: {exit_code:?}: {stderr}")
            };
            return Err(SchedulerError::RemoteError(reason));
        }

        info!(
            task_id = %task_id,
            "Shell任务执行完成: exit_code={:?}, duration={}ms",
            exit_code,
            duration_ms
        );

        env.insert(
            "result",
            json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
                "execution_time_ms": duration_ms,
            }),
        );
        Ok(env)
    }
}

/// 原样返回负载的执行器，用于联调
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, mut env: TaskEnv) -> SchedulerResult<TaskEnv> {
        debug!(task_id = ?env.task_id(), "echo");
        env.insert("result", json!({"echo": true}));
        Ok(env)
    }
}

/// 按名称创建执行器
pub fn executor_by_name(name: &str) -> SchedulerResult<Arc<dyn TaskExecutor>> {
    match name {
        "shell" => Ok(Arc::new(ShellExecutor::new())),
        "echo" => Ok(Arc::new(EchoExecutor)),
        other => Err(SchedulerError::config_error(format!("未知的执行器: {other}"))),
    }
}
