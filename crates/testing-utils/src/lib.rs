//! # Workerd Testing Utils
//!
//! Shared testing utilities for the workerd crates.
//!
//! ## Features
//!
//! - **Mock Store**: in-memory [`TaskStore`](workerd_core::TaskStore) implementation
//! - **Scripted Worker**: an RPC handler that behaves like a worker with
//!   predictable results (`ok*`, `fail`, `hang*`, `slow*`)
//! - **Test Data Builders**: task payloads with sensible defaults
//! - **Helpers**: in-memory worker connections and polling utilities
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! workerd-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
