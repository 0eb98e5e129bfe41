//! Worker端：连接调度器，执行分发过来的任务

pub mod components;
pub mod executors;
pub mod service;

pub use components::{DispatcherClient, TaskExecutionManager};
pub use executors::{executor_by_name, EchoExecutor, ShellExecutor, ShellTaskParams, TaskExecutor};
pub use service::{WorkerService, WorkerServiceBuilder};
