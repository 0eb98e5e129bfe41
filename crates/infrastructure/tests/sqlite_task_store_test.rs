use serde_json::json;
use tempfile::TempDir;

use workerd_core::{SchedulerError, TaskStore};
use workerd_infrastructure::SqliteTaskStore;
use workerd_testing_utils::TaskEnvBuilder;

fn store_in(dir: &TempDir) -> SqliteTaskStore {
    let path = dir.path().join("tasks.sqlite");
    SqliteTaskStore::new(format!("sqlite://{}", path.display()), 2)
}

#[tokio::test]
async fn test_insert_load_delete() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    store.start().await.unwrap();

    let env = TaskEnvBuilder::new("t1")
        .shared()
        .with_field("payload", json!({"n": 1, "tags": ["a", "b"]}))
        .build();
    store.insert("t1", &env).await.unwrap();
    store
        .insert("t2", &TaskEnvBuilder::new("t2").build())
        .await
        .unwrap();

    let rows = store.load_all().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].task_id, "t1");
    assert_eq!(rows[0].env, env);
    assert!(!rows[0].env.is_exclusive());
    assert_eq!(rows[1].task_id, "t2");

    store.delete("t1").await.unwrap();
    // 删除不存在的行不报错
    store.delete("t1").await.unwrap();
    store.delete("missing").await.unwrap();

    let ids: Vec<String> = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(ids, vec!["t2"]);

    store.stop().await.unwrap();
}

#[tokio::test]
async fn test_rows_survive_restart_in_insertion_order() {
    let dir = TempDir::new().unwrap();

    {
        let store = store_in(&dir);
        store.start().await.unwrap();
        for id in ["c", "a", "b"] {
            store
                .insert(id, &TaskEnvBuilder::new(id).build())
                .await
                .unwrap();
        }
        store.stop().await.unwrap();
    }

    let store = store_in(&dir);
    store.start().await.unwrap();
    let ids: Vec<String> = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}

#[tokio::test]
async fn test_duplicate_insert_fails() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    store.start().await.unwrap();

    let env = TaskEnvBuilder::new("t1").build();
    store.insert("t1", &env).await.unwrap();
    let err = store.insert("t1", &env).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DatabaseOperation(_)));
}

#[tokio::test]
async fn test_operations_require_start() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    let err = store.load_all().await.unwrap_err();
    assert!(matches!(err, SchedulerError::DatabaseOperation(_)));

    store.start().await.unwrap();
    // 重复启动无副作用
    store.start().await.unwrap();
    assert!(store.load_all().await.unwrap().is_empty());

    store.stop().await.unwrap();
    store.stop().await.unwrap();
    assert!(store
        .insert("t1", &TaskEnvBuilder::new("t1").build())
        .await
        .is_err());
}
