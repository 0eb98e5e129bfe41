//! 调度端核心组件
//!
//! - [`worker_manager::WorkerManager`]: Worker连接注册表与任务分发
//! - [`scheduler::FifoScheduler`]: 先进先出的任务队列
//! - [`task_manager::TaskManager`]: 任务持久化与崩溃恢复
//! - [`server::WorkerListener`]: 接受Worker的TCP连接

pub mod scheduler;
pub mod server;
pub mod task_manager;
pub mod worker_manager;

pub use scheduler::{FifoScheduler, SubmitHandle};
pub use server::WorkerListener;
pub use task_manager::TaskManager;
pub use worker_manager::{DispatchHandle, NewWorkerListener, WorkerManager};
