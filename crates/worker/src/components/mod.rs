pub mod dispatcher_client;
pub mod task_execution;

pub use dispatcher_client::DispatcherClient;
pub use task_execution::TaskExecutionManager;
