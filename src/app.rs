use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use workerd_core::{AppConfig, ConfigValidator, TaskStore};
use workerd_dispatcher::{FifoScheduler, TaskManager, WorkerListener, WorkerManager};
use workerd_infrastructure::SqliteTaskStore;
use workerd_worker::{WorkerService, WorkerServiceBuilder};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 运行调度器，接受Worker连接并分发任务
    Dispatcher,
    /// 运行Worker，连接调度器执行任务
    Worker,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(AppMode::Dispatcher),
            "worker" => Ok(AppMode::Worker),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }
}

/// 已启动的调度器
///
/// 任务存储已打开、持久化的任务已恢复、监听端口已绑定，调用
/// [`Dispatcher::serve`] 开始接受Worker连接。
pub struct Dispatcher {
    task_manager: TaskManager,
    listener: WorkerListener,
}

impl Dispatcher {
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::from_config(&config.database));
        Self::start_with_store(config, store).await
    }

    pub async fn start_with_store(config: &AppConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        let workers = WorkerManager::from_config(&config.dispatcher);
        let scheduler = FifoScheduler::new(workers.clone());
        let task_manager = TaskManager::new(scheduler, store);

        task_manager
            .start()
            .await
            .context("启动任务管理器失败")?;

        let listener = WorkerListener::bind(&config.dispatcher.bind_address, workers)
            .await
            .with_context(|| format!("绑定地址失败: {}", config.dispatcher.bind_address))?;

        Ok(Self {
            task_manager,
            listener,
        })
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn workers(&self) -> &WorkerManager {
        self.task_manager.scheduler().workers()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受Worker连接直到收到关闭信号，然后断开所有Worker并关闭任务存储
    pub async fn serve(self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let Self {
            task_manager,
            listener,
        } = self;

        listener.run(shutdown_rx).await?;

        let workers = task_manager.scheduler().workers();
        for name in workers.worker_names() {
            workers.worker_lost(&name);
        }

        let pending = task_manager.in_progress().len();
        if pending > 0 {
            info!("{} 个未完成的任务保留在存储中，下次启动时恢复", pending);
        }

        task_manager.stop().await.context("关闭任务存储失败")?;
        Ok(())
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        match mode {
            AppMode::Dispatcher => {
                config.database.validate()?;
                config.dispatcher.validate()?;
            }
            AppMode::Worker => config.worker.validate()?,
        }

        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行应用程序
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Dispatcher => self.run_dispatcher(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
        }
    }

    /// 运行Dispatcher模式
    async fn run_dispatcher(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Dispatcher服务");

        let dispatcher = Dispatcher::start(&self.config).await?;
        info!(
            "Dispatcher已就绪，恢复了 {} 个任务",
            dispatcher.task_manager().in_progress().len()
        );

        dispatcher.serve(shutdown_rx).await?;

        info!("Dispatcher服务已停止");
        Ok(())
    }

    /// 运行Worker模式
    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Worker服务: {}", self.config.worker.name);

        let worker_service: WorkerService = WorkerServiceBuilder::from_config(&self.config.worker)
            .context("创建Worker服务失败")?
            .build();

        worker_service.run(shutdown_rx).await?;
        if !worker_service.running_tasks().is_empty() {
            warn!(
                "Worker退出时仍有任务在运行: {:?}",
                worker_service.running_tasks()
            );
        }

        info!("Worker服务已停止");
        Ok(())
    }
}
