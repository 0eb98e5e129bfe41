//! Mock implementations for the store trait and the worker side of the RPC protocol
//!
//! These are in-memory doubles that can be used for unit testing without
//! requiring a database file or a real worker process.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use workerd_core::{SchedulerError, SchedulerResult, TaskEnv, TaskRow, TaskStore};
use workerd_rpc::{RpcError, RpcHandler, RpcResult};

/// Mock implementation of TaskStore for testing
///
/// Rows are kept in insertion order, which is also the order `load_all` returns.
#[derive(Debug, Clone, Default)]
pub struct MockTaskStore {
    rows: Arc<Mutex<Vec<TaskRow>>>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    fail_inserts: Arc<AtomicBool>,
}

impl MockTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<TaskRow>) -> Self {
        let store = Self::new();
        *store.rows.lock().unwrap() = rows;
        store
    }

    /// Make every following insert fail with a database error
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<TaskRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.rows.lock().unwrap().iter().any(|r| r.task_id == task_id)
    }

    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for MockTaskStore {
    async fn start(&self) -> SchedulerResult<()> {
        self.started.store(true, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> SchedulerResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, task_id: &str, env: &TaskEnv) -> SchedulerResult<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(SchedulerError::database_error("mock insert failure"));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.task_id == task_id) {
            return Err(SchedulerError::database_error(format!(
                "UNIQUE constraint failed: task.id ({task_id})"
            )));
        }
        rows.push(TaskRow {
            task_id: task_id.to_string(),
            env: env.clone(),
        });
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> SchedulerResult<()> {
        self.rows.lock().unwrap().retain(|r| r.task_id != task_id);
        Ok(())
    }

    async fn load_all(&self) -> SchedulerResult<Vec<TaskRow>> {
        Ok(self.rows())
    }
}

/// Scripted worker used on the worker side of a test connection
///
/// `run` behaves according to the payload's `task_id`:
///
/// - `ok*`: returns the payload with `foo = "bar"` added
/// - `slow*`: waits for the configured delay, then behaves like `ok*`
/// - `fail`: fails with a remote error
/// - `hang*`: never answers
/// - anything else: returns the payload unchanged
///
/// `get_running` returns the configured list, regardless of what is running.
#[derive(Debug, Clone, Default)]
pub struct MockWorkerHandler {
    delay: Duration,
    reported_running: Vec<String>,
    running: Arc<Mutex<BTreeSet<String>>>,
    received: Arc<Mutex<Vec<String>>>,
    max_parallel: Arc<Mutex<usize>>,
}

impl MockWorkerHandler {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Ids reported by `get_running` during registration
    pub fn with_reported_running(mut self, ids: &[&str]) -> Self {
        self.reported_running = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Task ids in the order `run` was called
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn running(&self) -> Vec<String> {
        self.running.lock().unwrap().iter().cloned().collect()
    }

    /// Highest number of `run` calls that were in progress at the same time
    pub fn max_parallel(&self) -> usize {
        *self.max_parallel.lock().unwrap()
    }

    fn enter(&self, task_id: &str) {
        self.received.lock().unwrap().push(task_id.to_string());
        let mut running = self.running.lock().unwrap();
        running.insert(task_id.to_string());
        let mut max = self.max_parallel.lock().unwrap();
        *max = (*max).max(running.len());
    }

    fn leave(&self, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
    }

    async fn run(&self, env: Value) -> RpcResult<Value> {
        let mut env = match env {
            Value::Object(map) => map,
            other => return Err(RpcError::remote(format!("expected an object, got {other}"))),
        };
        let task_id = env
            .get("task_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.enter(&task_id);
        let result = if task_id == "fail" {
            Err(RpcError::remote("Kaboom!"))
        } else if task_id.starts_with("hang") {
            std::future::pending::<()>().await;
            Ok(Value::Object(env))
        } else if task_id.starts_with("ok") || task_id.starts_with("slow") {
            if task_id.starts_with("slow") {
                tokio::time::sleep(self.delay).await;
            }
            env.insert("foo".to_string(), json!("bar"));
            Ok(Value::Object(env))
        } else {
            Ok(Value::Object(env))
        };
        self.leave(&task_id);
        result
    }
}

#[async_trait]
impl RpcHandler for MockWorkerHandler {
    async fn handle(&self, method: &str, args: Vec<Value>) -> RpcResult<Value> {
        match method {
            "run" => {
                let env = args.into_iter().next().unwrap_or(Value::Null);
                self.run(env).await
            }
            "get_running" => Ok(json!(self.reported_running)),
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}
