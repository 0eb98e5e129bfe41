use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_test::traced_test;

use workerd::{Dispatcher, ShutdownManager};
use workerd_core::{AppConfig, SchedulerError, TaskState, TaskStore};
use workerd_infrastructure::SqliteTaskStore;
use workerd_testing_utils::{TaskEnvBuilder, TestEnv};
use workerd_worker::{EchoExecutor, ShellExecutor, TaskExecutor, WorkerService};

const WAIT: Duration = Duration::from_secs(10);

fn test_config(temp_dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.url = format!("sqlite:{}", temp_dir.path().join("tasks.db").display());
    config.dispatcher.bind_address = "127.0.0.1:0".to_string();
    config.dispatcher.handshake_timeout_seconds = 2;
    config
}

fn spawn_worker(
    name: &str,
    addr: &str,
    executor: Arc<dyn TaskExecutor>,
    shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let service = WorkerService::builder(name)
        .concurrency(1)
        .dispatcher_address(addr.to_string())
        .reconnect_interval(Duration::from_millis(50))
        .executor(executor)
        .build();
    tokio::spawn(async move {
        let _ = service.run(shutdown_rx).await;
    })
}

async fn remaining_rows(config: &AppConfig) -> Result<Vec<String>> {
    let store = SqliteTaskStore::from_config(&config.database);
    store.start().await?;
    let rows = store.load_all().await?;
    store.stop().await?;
    let mut ids: Vec<String> = rows.into_iter().map(|row| row.task_id).collect();
    ids.sort();
    Ok(ids)
}

/// 任务经真实TCP连接分发给Worker执行，完成后从存储中删除
#[tokio::test]
#[traced_test]
async fn test_task_runs_on_remote_worker() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(&temp_dir);

    let dispatcher = Dispatcher::start(&config).await?;
    let addr = dispatcher.local_addr()?.to_string();
    let task_manager = dispatcher.task_manager().clone();
    let workers = dispatcher.workers().clone();

    let shutdown = ShutdownManager::new();
    let server = tokio::spawn(dispatcher.serve(shutdown.subscribe().await));
    spawn_worker("w1", &addr, Arc::new(EchoExecutor), shutdown.subscribe().await);

    assert!(TestEnv::wait_until(|| workers.has_worker("w1"), WAIT).await);

    let result = task_manager
        .add_task(TaskEnvBuilder::new("t1").with_field("payload", json!(42)).build())
        .await?;
    assert_eq!(result.task_id(), Some("t1"));
    assert_eq!(result.get("payload"), Some(&json!(42)));
    assert_eq!(result.get("result"), Some(&json!({"echo": true})));
    assert!(task_manager.in_progress().is_empty());

    shutdown.shutdown().await;
    tokio::time::timeout(WAIT, server).await???;

    assert!(remaining_rows(&config).await?.is_empty());
    Ok(())
}

/// 调度器重启后恢复未完成的任务，Worker连上后执行完毕
#[tokio::test]
#[traced_test]
async fn test_pending_tasks_survive_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(&temp_dir);

    // 第一次启动：没有Worker，任务只能排队
    let dispatcher = Dispatcher::start(&config).await?;
    let task_manager = dispatcher.task_manager().clone();
    let shutdown = ShutdownManager::new();
    let server = tokio::spawn(dispatcher.serve(shutdown.subscribe().await));

    for id in ["t1", "t2"] {
        let task_manager = task_manager.clone();
        tokio::spawn(async move {
            let _ = task_manager.add_task(TaskEnvBuilder::new(id).build()).await;
        });
    }
    assert!(TestEnv::wait_until(|| task_manager.in_progress().len() == 2, WAIT).await);

    shutdown.shutdown().await;
    tokio::time::timeout(WAIT, server).await???;
    assert_eq!(remaining_rows(&config).await?, vec!["t1", "t2"]);

    // 第二次启动：从存储恢复
    let dispatcher = Dispatcher::start(&config).await?;
    let addr = dispatcher.local_addr()?.to_string();
    let task_manager = dispatcher.task_manager().clone();

    let recovered = task_manager.in_progress();
    assert_eq!(recovered.len(), 2);
    assert!(recovered
        .values()
        .all(|record| record.state == TaskState::Pending));
    assert_eq!(task_manager.scheduler().queue_snapshot().len(), 2);

    let shutdown = ShutdownManager::new();
    let server = tokio::spawn(dispatcher.serve(shutdown.subscribe().await));
    spawn_worker("w1", &addr, Arc::new(EchoExecutor), shutdown.subscribe().await);

    assert!(TestEnv::wait_until(|| task_manager.in_progress().is_empty(), WAIT).await);

    shutdown.shutdown().await;
    tokio::time::timeout(WAIT, server).await???;
    assert!(remaining_rows(&config).await?.is_empty());
    Ok(())
}

/// 执行超时的任务以超时失败，Worker被踢出后重新连接
#[cfg(unix)]
#[tokio::test]
#[traced_test]
async fn test_timeout_evicts_worker_and_fails_task() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = test_config(&temp_dir);
    config.dispatcher.task_timeout_seconds = 1;

    let dispatcher = Dispatcher::start(&config).await?;
    let addr = dispatcher.local_addr()?.to_string();
    let task_manager = dispatcher.task_manager().clone();
    let workers = dispatcher.workers().clone();

    let shutdown = ShutdownManager::new();
    let server = tokio::spawn(dispatcher.serve(shutdown.subscribe().await));
    spawn_worker("w1", &addr, Arc::new(ShellExecutor::new()), shutdown.subscribe().await);
    assert!(TestEnv::wait_until(|| workers.has_worker("w1"), WAIT).await);
    let first_token = workers.snapshot()[0].token;

    let err = task_manager
        .add_task(TaskEnvBuilder::new("slow").with_command("sleep", &["30"]).build())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout { ref task_id, after_ms: 1000 } if task_id == "slow"));
    assert!(!task_manager.is_in_progress("slow"));

    // Worker重连后以新的令牌注册，之前的任务已不在其运行列表中
    let reconnected = TestEnv::wait_until(
        || {
            workers
                .snapshot()
                .first()
                .is_some_and(|w| w.token != first_token)
        },
        WAIT,
    )
    .await;
    assert!(reconnected);

    shutdown.shutdown().await;
    tokio::time::timeout(WAIT, server).await???;
    assert!(remaining_rows(&config).await?.is_empty());
    Ok(())
}

/// Worker中途退出，任务回到队首并由新的Worker完成
#[cfg(unix)]
#[tokio::test]
#[traced_test]
async fn test_task_requeued_when_worker_goes_away() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(&temp_dir);

    let dispatcher = Dispatcher::start(&config).await?;
    let addr = dispatcher.local_addr()?.to_string();
    let task_manager = dispatcher.task_manager().clone();
    let workers = dispatcher.workers().clone();

    let shutdown = ShutdownManager::new();
    let server = tokio::spawn(dispatcher.serve(shutdown.subscribe().await));

    let (stop_first, first_rx) = broadcast::channel(1);
    let first = spawn_worker("first", &addr, Arc::new(ShellExecutor::new()), first_rx);
    assert!(TestEnv::wait_until(|| workers.has_worker("first"), WAIT).await);

    let submitted = {
        let task_manager = task_manager.clone();
        tokio::spawn(async move {
            task_manager
                .add_task(TaskEnvBuilder::new("t1").with_command("sleep", &["30"]).build())
                .await
        })
    };
    assert!(
        TestEnv::wait_until(
            || workers.snapshot().first().is_some_and(|w| w.running_count() == 1),
            WAIT
        )
        .await
    );

    stop_first.send(())?;
    tokio::time::timeout(WAIT, first).await??;
    assert!(TestEnv::wait_until(|| !workers.has_worker("first"), WAIT).await);

    // 任务仍在队列中，存储里的记录保留
    assert!(task_manager.is_in_progress("t1"));
    assert_eq!(remaining_rows(&config).await?, vec!["t1"]);

    spawn_worker("second", &addr, Arc::new(EchoExecutor), shutdown.subscribe().await);
    let result = tokio::time::timeout(WAIT, submitted).await???;
    assert_eq!(result.get("result"), Some(&json!({"echo": true})));
    assert!(!task_manager.is_in_progress("t1"));

    shutdown.shutdown().await;
    tokio::time::timeout(WAIT, server).await???;
    Ok(())
}
