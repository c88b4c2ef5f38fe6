//! 配置管理
//!
//! 配置按以下顺序加载，后者覆盖前者：
//!
//! 1. 各配置段的默认值
//! 2. TOML 配置文件
//! 3. 环境变量（前缀 `SCHEDULER_`，嵌套字段用 `__` 分隔，如
//!    `SCHEDULER_JOB_STORE__MISFIRE_THRESHOLD_MS=30000`）

pub mod models;

pub use models::{AppConfig, DatabaseConfig, JobStoreConfig, AUTO_INSTANCE_ID};
