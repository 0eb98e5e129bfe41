pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{AppConfig, ConfigError, ConfigResult, ConfigValidator};
pub use errors::*;
pub use models::{QueueEntry, TaskEnv, TaskRecord, TaskRow, TaskState, WorkerHello, WorkerSnapshot};
pub use traits::TaskStore;
