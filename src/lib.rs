//! 远程Worker任务分发系统
//!
//! 调度器接受Worker的TCP连接，按先进先出顺序把任务分发给有空闲容量的Worker，
//! 未完成的任务持久化在SQLite中，重启后自动恢复。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application, Dispatcher};
pub use shutdown::ShutdownManager;
