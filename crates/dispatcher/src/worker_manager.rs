use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use workerd_core::{
    config::DispatcherConfig, SchedulerError, SchedulerResult, TaskEnv, WorkerHello,
    WorkerSnapshot,
};
use workerd_rpc::{RpcError, RpcPeer};

/// 新Worker注册成功后的回调，参数为Worker名称
pub type NewWorkerListener = Arc<dyn Fn(&str) + Send + Sync>;

type ResultSender = oneshot::Sender<SchedulerResult<TaskEnv>>;

/// 一次分发的执行结果
///
/// 解析为Worker返回的负载，或者 `RemoteError` / `WorkerGone` / `Timeout` 之一。
#[derive(Debug)]
pub struct DispatchHandle {
    worker: String,
    task_id: String,
    rx: oneshot::Receiver<SchedulerResult<TaskEnv>>,
}

impl DispatchHandle {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for DispatchHandle {
    type Output = SchedulerResult<TaskEnv>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let worker = self.worker.clone();
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(SchedulerError::worker_gone(worker))))
    }
}

struct WorkerEntry {
    token: u64,
    hello: WorkerHello,
    peer: RpcPeer,
    running: BTreeSet<String>,
    exclusive: bool,
    pending: HashMap<String, ResultSender>,
    registered_at: DateTime<Utc>,
}

impl WorkerEntry {
    fn can_accept(&self, exclusive: bool) -> bool {
        if self.exclusive {
            return false;
        }
        if exclusive {
            self.running.is_empty()
        } else {
            self.running.len() < self.hello.concurrency
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.hello.name.clone(),
            token: self.token,
            concurrency: self.hello.concurrency,
            running: self.running.iter().cloned().collect(),
            exclusive: self.exclusive,
            registered_at: self.registered_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    workers: HashMap<String, WorkerEntry>,
    /// 注册顺序，查找可用Worker时按此顺序
    order: Vec<String>,
}

impl Registry {
    fn remove(&mut self, name: &str) -> Option<WorkerEntry> {
        let entry = self.workers.remove(name)?;
        self.order.retain(|n| n != name);
        Some(entry)
    }
}

struct ManagerShared {
    registry: Mutex<Registry>,
    listeners: Mutex<Vec<NewWorkerListener>>,
    task_timeout: Duration,
    handshake_timeout: Duration,
}

/// Worker连接管理器
///
/// 维护已连接Worker的注册表：每个Worker的并发容量、正在执行的任务以及
/// 独占状态。分发任务时预留容量并通过RPC调用Worker的 `run` 方法；连接
/// 断开时所有未完成的分发都以 `WorkerGone` 失败。
///
/// 克隆得到的句柄共享同一个注册表。
#[derive(Clone)]
pub struct WorkerManager {
    shared: Arc<ManagerShared>,
}

impl WorkerManager {
    pub fn new(task_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                registry: Mutex::new(Registry::default()),
                listeners: Mutex::new(Vec::new()),
                task_timeout,
                handshake_timeout,
            }),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.task_timeout(), config.handshake_timeout())
    }

    pub fn task_timeout(&self) -> Duration {
        self.shared.task_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.shared.handshake_timeout
    }

    fn registry(&self) -> SchedulerResult<MutexGuard<'_, Registry>> {
        self.shared
            .registry
            .lock()
            .map_err(|_| SchedulerError::Internal("Worker注册表锁已中毒".to_string()))
    }

    /// 注册一个已完成握手的Worker连接
    ///
    /// 握手信息不合法、名称重复或者Worker报告仍有任务在运行时拒绝注册并关闭该连接。
    /// 注册成功后依次调用新Worker回调。
    pub async fn register_worker(
        &self,
        token: u64,
        peer: RpcPeer,
        greeting: Value,
    ) -> SchedulerResult<()> {
        let hello = match WorkerHello::from_greeting(&greeting) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(token, "拒绝Worker连接: {}", e);
                peer.close();
                return Err(e);
            }
        };

        if self.has_worker(&hello.name) {
            warn!(token, worker = %hello.name, "Worker名称已被占用，关闭新连接");
            peer.close();
            return Err(SchedulerError::DuplicateWorker { name: hello.name });
        }

        let running = match peer
            .call_with_timeout("get_running", vec![], self.shared.handshake_timeout)
            .await
        {
            Ok(value) => serde_json::from_value::<Vec<String>>(value).map_err(|e| {
                SchedulerError::rejected(format!("Worker {} 返回的运行任务列表无效: {e}", hello.name))
            }),
            Err(e) => Err(SchedulerError::rejected(format!(
                "查询Worker {} 的运行任务失败: {e}",
                hello.name
            ))),
        };
        let running = match running {
            Ok(running) => running,
            Err(e) => {
                warn!(token, worker = %hello.name, "{}", e);
                peer.close();
                return Err(e);
            }
        };
        if !running.is_empty() {
            warn!(
                token,
                worker = %hello.name,
                running = ?running,
                "Worker报告仍有任务在运行，拒绝注册"
            );
            peer.close();
            return Err(SchedulerError::rejected(format!(
                "Worker {} 仍有 {} 个任务在运行",
                hello.name,
                running.len()
            )));
        }

        let name = hello.name.clone();
        {
            let mut registry = self.registry()?;
            if registry.workers.contains_key(&name) {
                drop(registry);
                warn!(token, worker = %name, "Worker名称已被占用，关闭新连接");
                peer.close();
                return Err(SchedulerError::DuplicateWorker { name });
            }
            info!(
                token,
                worker = %name,
                concurrency = hello.concurrency,
                "Worker注册成功"
            );
            registry.workers.insert(
                name.clone(),
                WorkerEntry {
                    token,
                    hello,
                    peer,
                    running: BTreeSet::new(),
                    exclusive: false,
                    pending: HashMap::new(),
                    registered_at: Utc::now(),
                },
            );
            registry.order.push(name.clone());
        }

        let listeners: Vec<NewWorkerListener> = self
            .shared
            .listeners
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener(&name);
        }

        Ok(())
    }

    /// 注册新Worker回调
    pub fn notify_on_new_worker(&self, listener: NewWorkerListener) {
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.push(listener);
        }
    }

    /// 按注册顺序找到第一个能接收该任务的Worker
    pub fn find_available(&self, exclusive: bool) -> Option<String> {
        let registry = self.registry().ok()?;
        registry
            .order
            .iter()
            .find(|name| {
                registry
                    .workers
                    .get(name.as_str())
                    .is_some_and(|w| w.can_accept(exclusive))
            })
            .cloned()
    }

    pub fn has_worker(&self, name: &str) -> bool {
        self.registry()
            .map(|r| r.workers.contains_key(name))
            .unwrap_or(false)
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.registry().map(|r| r.order.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        match self.registry() {
            Ok(registry) => registry
                .order
                .iter()
                .filter_map(|name| registry.workers.get(name))
                .map(WorkerEntry::snapshot)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// 向指定Worker分发任务
    ///
    /// 前置检查同步完成：Worker不存在或者容量、独占条件不满足时立即返回
    /// `CapacityViolation`。检查通过后预留容量，在后台发起 `run` 调用，
    /// 执行结果通过返回的 [`DispatchHandle`] 获得。
    pub fn dispatch(&self, worker: &str, env: TaskEnv) -> SchedulerResult<DispatchHandle> {
        let task_id = env.require_task_id()?.to_string();
        let exclusive = env.is_exclusive();
        let (tx, rx) = oneshot::channel();

        let (token, peer) = {
            let mut registry = self.registry()?;
            let entry = registry.workers.get_mut(worker).ok_or_else(|| {
                SchedulerError::CapacityViolation(format!("Worker {worker} 未注册"))
            })?;
            if !entry.can_accept(exclusive) {
                return Err(SchedulerError::CapacityViolation(format!(
                    "Worker {worker} 无法接收任务 {task_id} (运行中 {}/{}, 独占: {}, 任务独占: {exclusive})",
                    entry.running.len(),
                    entry.hello.concurrency,
                    entry.exclusive,
                )));
            }
            if entry.running.contains(&task_id) {
                return Err(SchedulerError::CapacityViolation(format!(
                    "任务 {task_id} 已在Worker {worker} 上运行"
                )));
            }
            entry.running.insert(task_id.clone());
            entry.exclusive = exclusive;
            entry.pending.insert(task_id.clone(), tx);
            (entry.token, entry.peer.clone())
        };

        debug!(task_id = %task_id, worker, exclusive, "分发任务");

        let manager = self.clone();
        let worker_name = worker.to_string();
        let id = task_id.clone();
        tokio::spawn(async move {
            manager.run_remote(worker_name, token, id, peer, env).await;
        });

        Ok(DispatchHandle {
            worker: worker.to_string(),
            task_id,
            rx,
        })
    }

    async fn run_remote(
        &self,
        worker: String,
        token: u64,
        task_id: String,
        peer: RpcPeer,
        env: TaskEnv,
    ) {
        let timeout = self.shared.task_timeout;
        let outcome = peer
            .call_with_timeout("run", vec![env.into_value()], timeout)
            .await;

        let result = match outcome {
            Err(RpcError::ConnectionLost) => {
                // 断开处理会让所有未完成的分发以 WorkerGone 失败
                self.connection_lost(token);
                return;
            }
            Err(RpcError::Timeout { .. }) => {
                let sender = self.release(&worker, token, &task_id);
                warn!(
                    task_id = %task_id,
                    worker = %worker,
                    "任务执行超时 ({:?})，移除Worker",
                    timeout
                );
                peer.close();
                self.connection_lost(token);
                if let Some(tx) = sender {
                    let _ = tx.send(Err(SchedulerError::Timeout {
                        task_id,
                        after_ms: timeout.as_millis() as u64,
                    }));
                }
                return;
            }
            Err(RpcError::Remote(message)) => Err(SchedulerError::RemoteError(message)),
            Err(e) => Err(SchedulerError::RemoteError(e.to_string())),
            Ok(value) => TaskEnv::from_value(value).map_err(|e| {
                SchedulerError::RemoteError(format!("Worker返回了无效的结果: {e}"))
            }),
        };

        match &result {
            Ok(_) => debug!(task_id = %task_id, worker = %worker, "任务执行成功"),
            Err(e) => info!(task_id = %task_id, worker = %worker, "任务执行失败: {}", e),
        }

        if let Some(tx) = self.release(&worker, token, &task_id) {
            let _ = tx.send(result);
        }
    }

    /// 释放任务占用的容量，返回结果通道
    ///
    /// Worker已被移除（或已被同名的新连接取代）时返回 `None`，此时结果已经以
    /// `WorkerGone` 送出。
    fn release(&self, worker: &str, token: u64, task_id: &str) -> Option<ResultSender> {
        let mut registry = self.registry().ok()?;
        let entry = registry.workers.get_mut(worker)?;
        if entry.token != token {
            return None;
        }
        entry.running.remove(task_id);
        if entry.running.is_empty() {
            entry.exclusive = false;
        }
        entry.pending.remove(task_id)
    }

    /// 移除Worker，所有未完成的分发以 `WorkerGone` 失败。可重复调用。
    pub fn worker_lost(&self, name: &str) {
        let removed = match self.registry() {
            Ok(mut registry) => registry.remove(name),
            Err(_) => None,
        };
        if let Some(entry) = removed {
            self.evict(entry);
        }
    }

    /// 连接断开时调用
    ///
    /// 只有当 `token` 仍是该Worker当前的连接时才会移除，旧连接的断开不会影响
    /// 同名的新连接。
    pub fn connection_lost(&self, token: u64) {
        let removed = match self.registry() {
            Ok(mut registry) => {
                let name = registry
                    .workers
                    .iter()
                    .find(|(_, w)| w.token == token)
                    .map(|(name, _)| name.clone());
                name.and_then(|name| registry.remove(&name))
            }
            Err(_) => None,
        };
        match removed {
            Some(entry) => self.evict(entry),
            None => debug!(token, "连接断开，没有对应的已注册Worker"),
        }
    }

    fn evict(&self, entry: WorkerEntry) {
        let WorkerEntry {
            token,
            hello,
            peer,
            pending,
            ..
        } = entry;
        info!(
            token,
            worker = %hello.name,
            in_flight = pending.len(),
            "Worker已断开"
        );
        peer.close();
        for (task_id, tx) in pending {
            debug!(task_id = %task_id, worker = %hello.name, "任务因Worker断开而失败");
            let _ = tx.send(Err(SchedulerError::worker_gone(hello.name.clone())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_unknown_worker() {
        let manager = WorkerManager::new(Duration::from_secs(1), Duration::from_secs(1));
        let result = manager.dispatch("missing", TaskEnv::new("t1"));
        assert!(matches!(result, Err(SchedulerError::CapacityViolation(_))));
        assert!(manager.find_available(true).is_none());
        assert!(manager.worker_names().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_requires_task_id() {
        let manager = WorkerManager::new(Duration::from_secs(1), Duration::from_secs(1));
        let result = manager.dispatch("w1", TaskEnv::default());
        assert!(matches!(result, Err(SchedulerError::InvalidTaskParams(_))));
    }

    #[test]
    fn test_lost_unknown_worker_is_noop() {
        let manager = WorkerManager::new(Duration::from_secs(1), Duration::from_secs(1));
        manager.worker_lost("nobody");
        manager.connection_lost(42);
        assert!(manager.snapshot().is_empty());
    }
}
