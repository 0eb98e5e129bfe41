//! 任务持久化接口定义
//!
//! 任务管理器是任务表的唯一使用者：提交时写入，结束时删除，启动时全量读取用于恢复。
//!
//! ## 生命周期
//!
//! 存储是一个带有启动/停止钩子的服务，必须在 `start` 完成后才能接受任务操作。
//!
//! ```rust,ignore
//! use workerd_core::traits::TaskStore;
//!
//! async fn restore(store: &dyn TaskStore) -> SchedulerResult<()> {
//!     store.start().await?;
//!     for row in store.load_all().await? {
//!         println!("待恢复任务: {}", row.task_id);
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use crate::models::{TaskEnv, TaskRow};
use crate::SchedulerResult;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 打开存储，创建所需的表
    async fn start(&self) -> SchedulerResult<()>;

    /// 关闭存储
    async fn stop(&self) -> SchedulerResult<()>;

    /// 写入一行任务记录
    async fn insert(&self, task_id: &str, env: &TaskEnv) -> SchedulerResult<()>;

    /// 删除一行任务记录，行不存在时不报错
    async fn delete(&self, task_id: &str) -> SchedulerResult<()>;

    /// 读取所有未完成的任务记录
    async fn load_all(&self) -> SchedulerResult<Vec<TaskRow>>;
}
