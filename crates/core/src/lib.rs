pub mod config;
pub mod logging;

pub use config::{AppConfig, DatabaseConfig, JobStoreConfig, AUTO_INSTANCE_ID};
pub use logging::{init_logging, LogConfig, LogFormat};
