//! # 数据模型
//!
//! 任务分发系统的核心数据结构。
//!
//! ## 核心模型
//!
//! ### TaskEnv - 任务负载
//! 不透明的键值文档，只约定 `task_id` 和 `exclusive` 两个字段。
//!
//! ### TaskRecord - 执行中的任务
//! 任务管理器在内存中跟踪的任务记录，包含状态和分配的Worker。
//!
//! ### WorkerHello / WorkerSnapshot - Worker信息
//! 握手时上报的名称和并发度，以及运行时的容量快照。
//!
//! ## 状态流转
//!
//! ```text
//! Pending → Running → Done
//!              ↓    ↘ Failed
//!           Pending
//! ```

pub mod task;
pub mod worker;

pub use task::*;
pub use worker::*;
