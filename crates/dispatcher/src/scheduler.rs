use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use workerd_core::{QueueEntry, SchedulerError, SchedulerResult, TaskEnv};

use crate::worker_manager::{DispatchHandle, WorkerManager};

type OutcomeSender = oneshot::Sender<SchedulerResult<TaskEnv>>;

/// 提交任务后得到的结果
///
/// Worker掉线引起的失败不会出现在这里，调度器会重新排队；提交者只会看到成功、
/// 远程错误或超时。
#[derive(Debug)]
pub struct SubmitHandle {
    task_id: String,
    rx: oneshot::Receiver<SchedulerResult<TaskEnv>>,
}

impl SubmitHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for SubmitHandle {
    type Output = SchedulerResult<TaskEnv>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SchedulerError::ShuttingDown)))
    }
}

struct Waiting {
    env: TaskEnv,
    submitter: OutcomeSender,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<QueueEntry>,
    /// 已提交但尚未得到最终结果的任务，包括已分发出去的
    waiting: HashMap<String, Waiting>,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    workers: WorkerManager,
}

/// 先进先出调度器
///
/// 严格按队首调度：队首任务找不到可用Worker时整个队列等待，后面的任务不会越过它。
/// 提交任务、新Worker注册以及任务完成时都会触发一轮调度。
#[derive(Clone)]
pub struct FifoScheduler {
    shared: Arc<SchedulerShared>,
}

impl FifoScheduler {
    pub fn new(workers: WorkerManager) -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState::default()),
            workers: workers.clone(),
        });

        let weak = Arc::downgrade(&shared);
        workers.notify_on_new_worker(Arc::new(move |name: &str| {
            if let Some(shared) = weak.upgrade() {
                debug!(worker = name, "新Worker加入，触发调度");
                FifoScheduler { shared }.pump();
            }
        }));

        Self { shared }
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.shared.workers
    }

    fn state(&self) -> SchedulerResult<MutexGuard<'_, SchedulerState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| SchedulerError::Internal("调度队列锁已中毒".to_string()))
    }

    /// 提交任务到队尾并触发一轮调度
    ///
    /// 负载中的 `task_id` 必须与 `task_id` 参数一致，否则立即以参数错误结束，
    /// 不会进入队列。
    pub fn submit(&self, task_id: impl Into<String>, env: TaskEnv) -> SubmitHandle {
        let task_id = task_id.into();
        let (tx, rx) = oneshot::channel();
        let handle = SubmitHandle {
            task_id: task_id.clone(),
            rx,
        };

        if env.task_id() != Some(task_id.as_str()) {
            let _ = tx.send(Err(SchedulerError::invalid_params(format!(
                "任务负载中的 task_id 与提交的ID {task_id} 不一致"
            ))));
            return handle;
        }

        match self.state() {
            Ok(mut state) => {
                if state.waiting.contains_key(&task_id) {
                    let _ = tx.send(Err(SchedulerError::DuplicateTask { id: task_id }));
                    return handle;
                }
                let entry = QueueEntry::new(task_id.clone(), env.is_exclusive());
                debug!(task_id = %task_id, exclusive = entry.exclusive, "任务入队");
                state.queue.push_back(entry);
                state.waiting.insert(task_id, Waiting { env, submitter: tx });
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                return handle;
            }
        }

        self.pump();
        handle
    }

    /// 执行一轮调度
    ///
    /// 依次查看队首任务，有可用Worker就出队并分发，直到队列为空或者队首任务无法分发。
    /// 无法分发的任务直接以错误结束，不会阻塞后面的任务。
    pub fn pump(&self) {
        let mut state = match self.state() {
            Ok(state) => state,
            Err(e) => {
                error!("调度失败: {}", e);
                return;
            }
        };

        let mut rejected = Vec::new();
        let mut retried = false;
        while let Some(head) = state.queue.front() {
            let Some(worker) = self.shared.workers.find_available(head.exclusive) else {
                break;
            };
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            let Some(env) = state.waiting.get(&entry.task_id).map(|w| w.env.clone()) else {
                warn!(task_id = %entry.task_id, "队列中的任务没有对应的提交记录，已丢弃");
                continue;
            };

            match self.shared.workers.dispatch(&worker, env) {
                Ok(handle) => {
                    info!(task_id = %entry.task_id, worker = %worker, "任务已分发");
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.await_outcome(entry, handle).await;
                    });
                }
                Err(SchedulerError::CapacityViolation(reason)) => {
                    // 查询和分发之间Worker状态发生了变化，重新选择一次
                    debug!(task_id = %entry.task_id, worker = %worker, "Worker已不可用: {}", reason);
                    state.queue.push_front(entry);
                    if retried {
                        break;
                    }
                    retried = true;
                }
                Err(e) => {
                    warn!(task_id = %entry.task_id, worker = %worker, "任务无法分发: {}", e);
                    if let Some(waiting) = state.waiting.remove(&entry.task_id) {
                        rejected.push((waiting.submitter, e));
                    }
                }
            }
        }
        drop(state);

        for (submitter, e) in rejected {
            let _ = submitter.send(Err(e));
        }
    }

    async fn await_outcome(&self, entry: QueueEntry, handle: DispatchHandle) {
        let result = handle.await;

        match result {
            Err(e) if e.is_worker_gone() => {
                info!(task_id = %entry.task_id, "{}，任务重新排到队首", e);
                match self.state() {
                    Ok(mut state) => state.queue.push_front(entry),
                    Err(e) => error!("任务重新排队失败: {}", e),
                }
            }
            result => {
                let waiting = self
                    .state()
                    .ok()
                    .and_then(|mut state| state.waiting.remove(&entry.task_id));
                match waiting {
                    Some(waiting) => {
                        let _ = waiting.submitter.send(result);
                    }
                    None => warn!(task_id = %entry.task_id, "任务结果没有对应的提交者"),
                }
            }
        }

        self.pump();
    }

    /// 队列快照，按调度顺序排列的 `(task_id, exclusive)`
    pub fn queue_snapshot(&self) -> Vec<(String, bool)> {
        self.state()
            .map(|state| {
                state
                    .queue
                    .iter()
                    .map(|e| (e.task_id.clone(), e.exclusive))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_len(&self) -> usize {
        self.state().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// 已提交且尚未得到最终结果的任务数
    pub fn outstanding(&self) -> usize {
        self.state().map(|s| s.waiting.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler() -> FifoScheduler {
        FifoScheduler::new(WorkerManager::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_queue_keeps_arrival_order_without_workers() {
        let scheduler = scheduler();
        let _a = scheduler.submit("a", TaskEnv::new("a"));
        let _b = scheduler.submit("b", TaskEnv::new("b").with_exclusive(false));
        let _c = scheduler.submit("c", TaskEnv::new("c"));

        assert_eq!(
            scheduler.queue_snapshot(),
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true),
            ]
        );
        assert_eq!(scheduler.queue_len(), 3);
        assert_eq!(scheduler.outstanding(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_submission_fails_immediately() {
        let scheduler = scheduler();
        let _first = scheduler.submit("a", TaskEnv::new("a"));
        let second = scheduler.submit("a", TaskEnv::new("a"));

        let result = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::DuplicateTask { .. })));
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_task_id_rejected_without_queueing() {
        let scheduler = scheduler();
        let missing = scheduler.submit("x", TaskEnv::default());
        let other = scheduler.submit("y", TaskEnv::new("z"));

        let result = tokio::time::timeout(Duration::from_secs(1), missing)
            .await
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::InvalidTaskParams(_))));
        let result = tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .unwrap();
        assert!(matches!(result, Err(SchedulerError::InvalidTaskParams(_))));

        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropped_scheduler_reports_shutdown() {
        let (tx, rx) = oneshot::channel::<SchedulerResult<TaskEnv>>();
        drop(tx);
        let handle = SubmitHandle {
            task_id: "a".to_string(),
            rx,
        };
        assert!(matches!(handle.await, Err(SchedulerError::ShuttingDown)));
    }
}
