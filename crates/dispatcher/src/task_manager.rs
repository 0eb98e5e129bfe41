use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use workerd_core::{SchedulerError, SchedulerResult, TaskEnv, TaskRecord, TaskState, TaskStore};

use crate::scheduler::FifoScheduler;

struct TaskManagerShared {
    scheduler: FifoScheduler,
    store: Arc<dyn TaskStore>,
    in_progress: Mutex<HashMap<String, TaskRecord>>,
}

/// 任务管理器
///
/// 任务在交给调度器之前先持久化，得到最终结果（成功、远程错误或超时）后才删除。
/// 进程重启时 [`TaskManager::start`] 会把存储中的所有任务重新提交，因此每个任务
/// 至少执行一次。
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<TaskManagerShared>,
}

impl TaskManager {
    pub fn new(scheduler: FifoScheduler, store: Arc<dyn TaskStore>) -> Self {
        Self {
            shared: Arc::new(TaskManagerShared {
                scheduler,
                store,
                in_progress: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scheduler(&self) -> &FifoScheduler {
        &self.shared.scheduler
    }

    fn in_progress_map(&self) -> SchedulerResult<MutexGuard<'_, HashMap<String, TaskRecord>>> {
        self.shared
            .in_progress
            .lock()
            .map_err(|_| SchedulerError::Internal("任务表锁已中毒".to_string()))
    }

    /// 启动存储并恢复上次未完成的任务
    ///
    /// 负载中的 `task_id` 与记录不一致的行无法调度，记录错误日志后从存储中删除。
    #[instrument(skip(self))]
    pub async fn start(&self) -> SchedulerResult<()> {
        self.shared.store.start().await?;

        let rows = self.shared.store.load_all().await?;
        if rows.is_empty() {
            debug!("没有需要恢复的任务");
            return Ok(());
        }

        info!("恢复 {} 个未完成的任务", rows.len());
        for row in rows {
            if row.env.task_id() != Some(row.task_id.as_str()) {
                // 负载与记录ID不一致的任务永远无法分发，留着只会在每次启动时重复出现
                error!(
                    task_id = %row.task_id,
                    env = %row.env.to_json_string().unwrap_or_default(),
                    "持久化的任务负载缺少匹配的 task_id，丢弃该记录"
                );
                if let Err(e) = self.shared.store.delete(&row.task_id).await {
                    error!(task_id = %row.task_id, "删除任务记录失败: {}", e);
                }
                continue;
            }
            {
                let mut in_progress = self.in_progress_map()?;
                if in_progress.contains_key(&row.task_id) {
                    warn!(task_id = %row.task_id, "任务已在执行中，跳过恢复");
                    continue;
                }
                in_progress.insert(
                    row.task_id.clone(),
                    TaskRecord::new(row.task_id.clone(), row.env.clone()),
                );
            }
            debug!(task_id = %row.task_id, "重新提交任务");
            // 恢复的任务没有等待结果的调用方，完成后的清理由后台任务负责
            let _ = self.track(row.task_id, row.env);
        }

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> SchedulerResult<()> {
        self.shared.store.stop().await
    }

    /// 提交任务并等待最终结果
    ///
    /// 负载必须包含字符串 `task_id`，且同一ID不能重复提交。返回Worker补充了执行
    /// 结果的负载，或者远程错误、超时。
    pub async fn add_task(&self, env: TaskEnv) -> SchedulerResult<TaskEnv> {
        let task_id = env.require_task_id()?.to_string();

        {
            let mut in_progress = self.in_progress_map()?;
            if in_progress.contains_key(&task_id) {
                return Err(SchedulerError::DuplicateTask { id: task_id });
            }
            in_progress.insert(task_id.clone(), TaskRecord::new(task_id.clone(), env.clone()));
        }

        if let Err(e) = self.shared.store.insert(&task_id, &env).await {
            error!(task_id = %task_id, "持久化任务失败: {}", e);
            if let Ok(mut in_progress) = self.in_progress_map() {
                in_progress.remove(&task_id);
            }
            return Err(e);
        }
        info!(task_id = %task_id, "任务已提交");

        self.track(task_id, env)
            .await
            .unwrap_or(Err(SchedulerError::ShuttingDown))
    }

    /// 交给调度器，并在后台等待结果完成清理
    fn track(
        &self,
        task_id: String,
        env: TaskEnv,
    ) -> oneshot::Receiver<SchedulerResult<TaskEnv>> {
        let handle = self.shared.scheduler.submit(task_id.clone(), env);
        let (tx, rx) = oneshot::channel();
        let manager = self.clone();

        tokio::spawn(async move {
            let result = handle.await;
            manager.finish(&task_id, &result).await;
            let _ = tx.send(result);
        });

        rx
    }

    async fn finish(&self, task_id: &str, result: &SchedulerResult<TaskEnv>) {
        let terminal = match result {
            Ok(_) => {
                info!(task_id, "任务完成");
                true
            }
            Err(e) if e.is_terminal() => {
                warn!(task_id, "任务失败: {}", e);
                true
            }
            Err(e @ SchedulerError::InvalidTaskParams(_)) => {
                error!(task_id, "任务无法执行，删除持久化记录: {}", e);
                true
            }
            Err(e) => {
                warn!(task_id, "任务未得到最终结果，保留持久化记录: {}", e);
                false
            }
        };

        if terminal {
            if let Err(e) = self.shared.store.delete(task_id).await {
                error!(task_id, "删除任务记录失败: {}", e);
            }
        }
        if let Ok(mut in_progress) = self.in_progress_map() {
            in_progress.remove(task_id);
        }
    }

    pub fn is_in_progress(&self, task_id: &str) -> bool {
        self.in_progress_map()
            .map(|m| m.contains_key(task_id))
            .unwrap_or(false)
    }

    /// 所有未完成任务的快照
    ///
    /// 仍在队列中的任务为 `Pending`，已分发的任务为 `Running` 并带上所在Worker。
    pub fn in_progress(&self) -> HashMap<String, TaskRecord> {
        let queued: HashSet<String> = self
            .shared
            .scheduler
            .queue_snapshot()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let assigned: HashMap<String, String> = self
            .shared
            .scheduler
            .workers()
            .snapshot()
            .into_iter()
            .flat_map(|w| {
                let name = w.name;
                w.running.into_iter().map(move |id| (id, name.clone()))
            })
            .collect();

        let mut records = self
            .in_progress_map()
            .map(|m| m.clone())
            .unwrap_or_default();
        for (task_id, record) in records.iter_mut() {
            if let Some(worker) = assigned.get(task_id) {
                record.state = TaskState::Running;
                record.worker = Some(worker.clone());
            } else if queued.contains(task_id) {
                record.state = TaskState::Pending;
            }
        }
        records
    }
}
