//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the job store workspace: in-memory mock
//! repositories, test data builders, and async test helpers.
//!
//! ```rust
//! use scheduler_testing_utils::{JobDetailBuilder, MockRepositories, TriggerBuilder};
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
