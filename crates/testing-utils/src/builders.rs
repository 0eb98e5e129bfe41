//! Test data builders for creating task payloads
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use serde_json::Value;
use workerd_core::{TaskEnv, TaskRow};

/// Builder for creating test task payloads
pub struct TaskEnvBuilder {
    env: TaskEnv,
}

impl TaskEnvBuilder {
    pub fn new(task_id: &str) -> Self {
        Self {
            env: TaskEnv::new(task_id),
        }
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.env = self.env.with_exclusive(exclusive);
        self
    }

    pub fn shared(self) -> Self {
        self.exclusive(false)
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.env.insert(key, value);
        self
    }

    /// Shell command payload understood by the shell executor
    pub fn with_command(self, command: &str, args: &[&str]) -> Self {
        self.with_field("command", Value::from(command))
            .with_field("args", Value::from(args.to_vec()))
    }

    pub fn build(self) -> TaskEnv {
        self.env
    }

    pub fn build_row(self) -> TaskRow {
        let task_id = self.env.task_id().unwrap_or_default().to_string();
        TaskRow {
            task_id,
            env: self.env,
        }
    }
}
