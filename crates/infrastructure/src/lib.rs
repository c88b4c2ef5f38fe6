//! 作业存储的 SQLite 持久化实现

pub mod database;
pub mod error_handling;

pub use database::*;
pub use error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};
