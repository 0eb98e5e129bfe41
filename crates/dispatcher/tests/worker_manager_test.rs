use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing_test::traced_test;

use workerd_core::SchedulerError;
use workerd_dispatcher::WorkerManager;
use workerd_testing_utils::{MockWorkerHandler, TaskEnvBuilder, TestEnv, WorkerConnection};

const WAIT: Duration = Duration::from_secs(2);

fn manager() -> WorkerManager {
    WorkerManager::new(Duration::from_secs(5), Duration::from_secs(1))
}

async fn attach(
    manager: &WorkerManager,
    token: u64,
    name: &str,
    concurrency: usize,
    handler: MockWorkerHandler,
) -> WorkerConnection {
    let conn = TestEnv::connect_worker(TestEnv::greeting(name, concurrency), Arc::new(handler))
        .await
        .unwrap();
    manager
        .register_worker(token, conn.dispatcher.clone(), conn.greeting.clone())
        .await
        .unwrap();
    conn
}

#[tokio::test]
async fn test_register_notifies_listeners() {
    let manager = manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        manager.notify_on_new_worker(Arc::new(move |name: &str| {
            seen.lock().unwrap().push(name.to_string());
        }));
    }

    let _w1 = attach(&manager, 1, "w1", 2, MockWorkerHandler::new()).await;
    let _w2 = attach(&manager, 2, "w2", 1, MockWorkerHandler::new()).await;

    assert_eq!(*seen.lock().unwrap(), vec!["w1", "w2"]);
    assert_eq!(manager.worker_names(), vec!["w1", "w2"]);
    assert!(manager.has_worker("w1"));

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].name, "w1");
    assert_eq!(snapshot[0].token, 1);
    assert_eq!(snapshot[0].concurrency, 2);
    assert!(snapshot[0].is_idle());
}

#[tokio::test]
#[traced_test]
async fn test_malformed_greeting_rejected() {
    let manager = manager();
    let greetings = vec![
        json!({"name": "no_concurrency"}),
        json!({"concurrency": 2}),
        json!({"name": "unique4", "concurrency": "not a number"}),
    ];

    for (token, greeting) in greetings.into_iter().enumerate() {
        let conn = TestEnv::connect_worker(greeting, Arc::new(MockWorkerHandler::new()))
            .await
            .unwrap();
        let result = manager
            .register_worker(token as u64, conn.dispatcher.clone(), conn.greeting.clone())
            .await;
        assert!(matches!(result, Err(SchedulerError::WorkerRejected(_))));
        tokio::time::timeout(WAIT, conn.worker.closed()).await.unwrap();
    }

    assert!(manager.worker_names().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let manager = manager();
    let original = attach(&manager, 1, "w1", 1, MockWorkerHandler::new()).await;

    let conn = TestEnv::connect_worker(
        TestEnv::greeting("w1", 3),
        Arc::new(MockWorkerHandler::new()),
    )
    .await
    .unwrap();
    let result = manager
        .register_worker(2, conn.dispatcher.clone(), conn.greeting.clone())
        .await;
    assert!(matches!(
        result,
        Err(SchedulerError::DuplicateWorker { ref name }) if name == "w1"
    ));
    tokio::time::timeout(WAIT, conn.worker.closed()).await.unwrap();

    // 原来的连接不受影响
    assert!(original.worker.is_connected());
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].token, 1);
    assert_eq!(snapshot[0].concurrency, 1);

    let result = manager
        .dispatch("w1", TaskEnvBuilder::new("ok1").build())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.get("foo"), Some(&json!("bar")));
}

#[tokio::test]
#[traced_test]
async fn test_worker_reporting_running_tasks_rejected() {
    let manager = manager();
    let handler = MockWorkerHandler::new().with_reported_running(&["a", "b"]);
    let conn = TestEnv::connect_worker(TestEnv::greeting("busy", 2), Arc::new(handler))
        .await
        .unwrap();

    let result = manager
        .register_worker(1, conn.dispatcher.clone(), conn.greeting.clone())
        .await;
    assert!(matches!(result, Err(SchedulerError::WorkerRejected(_))));
    assert!(!manager.has_worker("busy"));
    tokio::time::timeout(WAIT, conn.worker.closed()).await.unwrap();
}

#[tokio::test]
async fn test_run_success_and_remote_error() {
    let manager = manager();
    let _w = attach(&manager, 1, "w1", 2, MockWorkerHandler::new()).await;

    let result = manager
        .dispatch("w1", TaskEnvBuilder::new("ok1").build())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result.task_id(), Some("ok1"));
    assert_eq!(result.get("foo"), Some(&json!("bar")));

    let err = manager
        .dispatch("w1", TaskEnvBuilder::new("fail").build())
        .unwrap()
        .await
        .unwrap_err();
    match err {
        SchedulerError::RemoteError(message) => assert!(message.contains("Kaboom")),
        other => panic!("unexpected error: {other:?}"),
    }

    // 远程错误不影响Worker本身
    assert!(manager.has_worker("w1"));
    assert!(manager.snapshot()[0].is_idle());
}

#[tokio::test]
async fn test_capacity_violation_is_immediate() {
    let manager = manager();
    let _w = attach(&manager, 1, "w1", 1, MockWorkerHandler::new()).await;

    let _hang1 = manager
        .dispatch("w1", TaskEnvBuilder::new("hang1").build())
        .unwrap();
    let result = manager.dispatch("w1", TaskEnvBuilder::new("hang2").build());
    assert!(matches!(result, Err(SchedulerError::CapacityViolation(_))));

    let result = manager.dispatch("nobody", TaskEnvBuilder::new("hang3").build());
    assert!(matches!(result, Err(SchedulerError::CapacityViolation(_))));

    assert_eq!(manager.snapshot()[0].running, vec!["hang1"]);
}

#[tokio::test]
async fn test_exclusivity_rules() {
    let manager = manager();
    let _w = attach(&manager, 1, "w1", 2, MockWorkerHandler::new()).await;

    // 非独占任务可以共享Worker，但不能与独占任务共存
    let _a = manager
        .dispatch("w1", TaskEnvBuilder::new("hang-a").shared().build())
        .unwrap();
    assert_eq!(manager.find_available(true), None);
    assert_eq!(manager.find_available(false), Some("w1".to_string()));
    assert!(matches!(
        manager.dispatch("w1", TaskEnvBuilder::new("hang-x").build()),
        Err(SchedulerError::CapacityViolation(_))
    ));

    let _b = manager
        .dispatch("w1", TaskEnvBuilder::new("hang-b").shared().build())
        .unwrap();
    assert_eq!(manager.find_available(false), None);
    assert!(matches!(
        manager.dispatch("w1", TaskEnvBuilder::new("hang-c").shared().build()),
        Err(SchedulerError::CapacityViolation(_))
    ));

    // 运行独占任务的Worker不接收任何任务
    let _w2 = attach(&manager, 2, "w2", 4, MockWorkerHandler::new()).await;
    assert_eq!(manager.find_available(true), Some("w2".to_string()));
    let _x = manager
        .dispatch("w2", TaskEnvBuilder::new("hang-x").build())
        .unwrap();
    assert!(manager.snapshot()[1].exclusive);
    assert_eq!(manager.find_available(false), None);
    assert!(matches!(
        manager.dispatch("w2", TaskEnvBuilder::new("hang-d").shared().build()),
        Err(SchedulerError::CapacityViolation(_))
    ));
}

#[tokio::test]
async fn test_capacity_released_after_completion() {
    let manager = manager();
    let handler = MockWorkerHandler::new();
    let _w = attach(&manager, 1, "w1", 1, handler.clone()).await;

    for id in ["ok1", "ok2", "ok3"] {
        let handle = manager
            .dispatch("w1", TaskEnvBuilder::new(id).build())
            .unwrap();
        assert_eq!(handle.worker(), "w1");
        handle.await.unwrap();
    }

    assert_eq!(handler.received(), vec!["ok1", "ok2", "ok3"]);
    assert_eq!(handler.max_parallel(), 1);
    let snapshot = manager.snapshot();
    assert!(snapshot[0].is_idle());
    assert!(!snapshot[0].exclusive);
}

#[tokio::test]
#[traced_test]
async fn test_worker_lost_fails_in_flight_dispatches() {
    let manager = manager();
    let conn = attach(&manager, 1, "w1", 2, MockWorkerHandler::new()).await;

    let h1 = manager
        .dispatch("w1", TaskEnvBuilder::new("hang1").shared().build())
        .unwrap();
    let h2 = manager
        .dispatch("w1", TaskEnvBuilder::new("hang2").shared().build())
        .unwrap();

    manager.worker_lost("w1");
    manager.worker_lost("w1");

    for handle in [h1, h2] {
        let err = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerGone { ref name } if name == "w1"));
    }
    assert!(!manager.has_worker("w1"));
    tokio::time::timeout(WAIT, conn.worker.closed()).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_dispatch() {
    let manager = manager();
    let conn = attach(&manager, 7, "w1", 1, MockWorkerHandler::new()).await;

    let handle = manager
        .dispatch("w1", TaskEnvBuilder::new("hang1").build())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.worker.close();

    let err = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap_err();
    assert!(err.is_worker_gone());
    assert!(TestEnv::wait_until(|| !manager.has_worker("w1"), WAIT).await);
}

#[tokio::test]
async fn test_stale_token_does_not_evict_successor() {
    let manager = manager();
    let old = attach(&manager, 1, "w1", 1, MockWorkerHandler::new()).await;
    manager.connection_lost(1);
    assert!(!manager.has_worker("w1"));
    tokio::time::timeout(WAIT, old.worker.closed()).await.unwrap();

    let _new = attach(&manager, 2, "w1", 1, MockWorkerHandler::new()).await;
    manager.connection_lost(1);
    assert!(manager.has_worker("w1"));
    assert_eq!(manager.snapshot()[0].token, 2);
}

#[tokio::test]
#[traced_test]
async fn test_timeout_evicts_worker() {
    let manager = WorkerManager::new(Duration::from_millis(100), Duration::from_secs(1));
    let conn = attach(&manager, 1, "w1", 1, MockWorkerHandler::new()).await;

    let err = manager
        .dispatch("w1", TaskEnvBuilder::new("hang1").build())
        .unwrap()
        .await
        .unwrap_err();
    // 不足一秒的超时也要如实报告
    assert!(matches!(
        err,
        SchedulerError::Timeout { ref task_id, after_ms: 100 } if task_id == "hang1"
    ));
    assert!(err.is_terminal());

    assert!(!manager.has_worker("w1"));
    tokio::time::timeout(WAIT, conn.worker.closed()).await.unwrap();
}
