pub mod app_config;
pub mod database;
pub mod job_store;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use job_store::{JobStoreConfig, AUTO_INSTANCE_ID};
