//! Test helper utilities and common testing patterns
//!
//! This module provides utilities for connecting in-memory workers and for
//! waiting on asynchronous state changes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;
use workerd_rpc::{RpcHandler, RpcPeer, RpcResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Both ends of an in-memory worker connection after the handshake
pub struct WorkerConnection {
    /// Dispatcher side, to be handed to the worker manager
    pub dispatcher: RpcPeer,
    /// Greeting the worker sent
    pub greeting: Value,
    /// Worker side, closing it simulates the worker going away
    pub worker: RpcPeer,
}

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    pub fn greeting(name: &str, concurrency: usize) -> Value {
        json!({"name": name, "concurrency": concurrency})
    }

    /// Connect a worker over an in-memory pipe and complete the handshake
    pub async fn connect_worker(
        greeting: Value,
        handler: Arc<dyn RpcHandler>,
    ) -> RpcResult<WorkerConnection> {
        let (dispatcher_io, worker_io) = tokio::io::duplex(64 * 1024);
        let accepting = tokio::spawn(workerd_rpc::accept(
            dispatcher_io,
            Arc::new(workerd_rpc::NoMethods),
            HANDSHAKE_TIMEOUT,
        ));
        let worker = workerd_rpc::connect(worker_io, greeting, handler, HANDSHAKE_TIMEOUT).await?;
        let (dispatcher, greeting) = accepting
            .await
            .map_err(|e| workerd_rpc::RpcError::Handshake(e.to_string()))??;
        Ok(WorkerConnection {
            dispatcher,
            greeting,
            worker,
        })
    }

    /// Wait for a condition to be true with timeout
    pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        condition()
    }

    /// Wait for an async condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }
}
