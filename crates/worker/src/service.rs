use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use workerd_core::config::WorkerConfig;
use workerd_core::{SchedulerResult, WorkerHello};

use crate::components::{DispatcherClient, TaskExecutionManager};
use crate::executors::{executor_by_name, ShellExecutor, TaskExecutor};

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_name: String,
    concurrency: usize,
    dispatcher_address: String,
    reconnect_interval: Duration,
    handshake_timeout: Duration,
    executor: Arc<dyn TaskExecutor>,
    hostname: String,
}

impl WorkerServiceBuilder {
    /// 创建新的构建器
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            concurrency: 1,
            dispatcher_address: "127.0.0.1:7890".to_string(),
            reconnect_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            executor: Arc::new(ShellExecutor::new()),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }

    /// 按配置创建构建器
    pub fn from_config(config: &WorkerConfig) -> SchedulerResult<Self> {
        Ok(Self::new(config.name.clone())
            .concurrency(config.concurrency)
            .dispatcher_address(config.dispatcher_address.clone())
            .reconnect_interval(config.reconnect_interval())
            .executor(executor_by_name(&config.executor)?))
    }

    /// 设置并发任务数
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn dispatcher_address(mut self, dispatcher_address: String) -> Self {
        self.dispatcher_address = dispatcher_address;
        self
    }

    /// 设置断线重连间隔
    pub fn reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.reconnect_interval = reconnect_interval;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// 设置主机名
    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    /// 设置任务执行器
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        info!("使用任务执行器: {}", executor.name());
        self.executor = executor;
        self
    }

    /// 构建WorkerService
    pub fn build(self) -> WorkerService {
        let hello = WorkerHello {
            name: self.worker_name,
            concurrency: self.concurrency,
        };
        let execution = Arc::new(TaskExecutionManager::new(
            hello.name.clone(),
            self.executor,
        ));

        let mut greeting = hello.to_greeting();
        greeting["hostname"] = json!(self.hostname);

        let client = DispatcherClient::new(
            self.dispatcher_address,
            greeting.clone(),
            execution.clone(),
            self.reconnect_interval,
            self.handshake_timeout,
        );

        WorkerService {
            hello,
            greeting,
            execution,
            client,
        }
    }
}

/// Worker服务
///
/// 连接调度器并执行分发过来的任务，连接断开后自动重连。
pub struct WorkerService {
    hello: WorkerHello,
    greeting: Value,
    execution: Arc<TaskExecutionManager>,
    client: DispatcherClient,
}

impl WorkerService {
    /// 创建构建器
    pub fn builder(worker_name: impl Into<String>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(worker_name)
    }

    pub fn name(&self) -> &str {
        &self.hello.name
    }

    pub fn concurrency(&self) -> usize {
        self.hello.concurrency
    }

    /// 握手时发送给调度器的信息
    pub fn greeting(&self) -> &Value {
        &self.greeting
    }

    /// 获取正在运行的任务列表
    pub fn running_tasks(&self) -> Vec<String> {
        self.execution.running_tasks()
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "启动Worker服务: {} (并发数: {})",
            self.hello.name, self.hello.concurrency
        );
        self.client.run(shutdown_rx).await?;
        info!("Worker服务已停止: {}", self.hello.name);
        Ok(())
    }
}
