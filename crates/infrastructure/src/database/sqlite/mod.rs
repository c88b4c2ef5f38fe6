pub mod schema;
pub mod sqlite_calendar_repository;
pub mod sqlite_fired_trigger_repository;
pub mod sqlite_instance_repository;
pub mod sqlite_job_repository;
pub mod sqlite_lock_repository;
pub mod sqlite_paused_group_repository;
pub mod sqlite_trigger_repository;

pub use sqlite_calendar_repository::SqliteCalendarRepository;
pub use sqlite_fired_trigger_repository::SqliteFiredTriggerRepository;
pub use sqlite_instance_repository::SqliteInstanceRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_lock_repository::SqliteLockRepository;
pub use sqlite_paused_group_repository::SqlitePausedGroupRepository;
pub use sqlite_trigger_repository::SqliteTriggerRepository;

use anyhow::{Context, Result};
use scheduler_core::config::models::DatabaseConfig;
use scheduler_domain::StoreRepositories;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        // 内存数据库每个连接都是独立的库，只能使用单个常驻连接
        let pool = if config.url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(&config.url)
                .await
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
                .connect(&config.url)
                .await
        }
        .with_context(|| format!("连接数据库失败: {}", config.url))?;

        info!("数据库连接池已建立: {}", config.url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 构建指定调度器名称下的全部仓储，所有仓储共享同一个连接池
    pub fn repositories(&self, instance_name: &str) -> StoreRepositories {
        let pool = self.pool.clone();
        StoreRepositories {
            jobs: Arc::new(SqliteJobRepository::new(pool.clone(), instance_name)),
            triggers: Arc::new(SqliteTriggerRepository::new(pool.clone(), instance_name)),
            fired_triggers: Arc::new(SqliteFiredTriggerRepository::new(pool.clone(), instance_name)),
            calendars: Arc::new(SqliteCalendarRepository::new(pool.clone(), instance_name)),
            paused_groups: Arc::new(SqlitePausedGroupRepository::new(pool.clone(), instance_name)),
            instances: Arc::new(SqliteInstanceRepository::new(pool.clone(), instance_name)),
            locks: Arc::new(SqliteLockRepository::new(pool, instance_name)),
        }
    }
}

pub type DbPool = Pool<Sqlite>;
