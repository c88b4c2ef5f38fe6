use async_trait::async_trait;
use scheduler_domain::{Calendar, CalendarRepository};
use scheduler_errors::{SchedulerError, SchedulerResult};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "日历";

/// 日历以 JSON 数据块整体存储
pub struct SqliteCalendarRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteCalendarRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, name: Option<&str>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match name {
            Some(name) => ctx.with_key(name),
            None => ctx,
        }
    }

    fn encode(name: &str, calendar: &Calendar) -> SchedulerResult<String> {
        serde_json::to_string(calendar)
            .map_err(|e| SchedulerError::Serialization(format!("序列化日历 '{name}' 失败: {e}")))
    }
}

#[async_trait]
impl CalendarRepository for SqliteCalendarRepository {
    async fn insert(&self, name: &str, calendar: &Calendar) -> SchedulerResult<()> {
        let blob = Self::encode(name, calendar)?;
        sqlx::query(
            "INSERT INTO js_calendars (sched_name, calendar_name, calendar) VALUES ($1, $2, $3)",
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, Some(name)),
                e,
            )
        })?;

        debug!("创建日历成功: {}", name);
        Ok(())
    }

    async fn update(&self, name: &str, calendar: &Calendar) -> SchedulerResult<bool> {
        let blob = Self::encode(name, calendar)?;
        let result = sqlx::query(
            "UPDATE js_calendars SET calendar = $3 WHERE sched_name = $1 AND calendar_name = $2",
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(name)),
                e,
            )
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT calendar FROM js_calendars WHERE sched_name = $1 AND calendar_name = $2",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(name)), e)
        })?;

        blob.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                RepositoryErrorHelpers::mapping_error(
                    Self::ctx(RepositoryOperation::Read, Some(name)),
                    e,
                )
            })
        })
        .transpose()
    }

    async fn exists(&self, name: &str) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM js_calendars WHERE sched_name = $1 AND calendar_name = $2",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(name)), e)
        })?;
        Ok(count > 0)
    }

    async fn delete(&self, name: &str) -> SchedulerResult<bool> {
        let result =
            sqlx::query("DELETE FROM js_calendars WHERE sched_name = $1 AND calendar_name = $2")
                .bind(&self.sched_name)
                .bind(name)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryErrorHelpers::database_error(
                        Self::ctx(RepositoryOperation::Delete, Some(name)),
                        e,
                    )
                })?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM js_calendars WHERE sched_name = $1")
            .bind(&self.sched_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
            })?;
        Ok(count as usize)
    }

    async fn names(&self) -> SchedulerResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT calendar_name FROM js_calendars WHERE sched_name = $1 ORDER BY calendar_name",
        )
        .bind(&self.sched_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Ok(names)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM js_calendars WHERE sched_name = $1")
            .bind(&self.sched_name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::database_error(
                    Self::ctx(RepositoryOperation::BatchUpdate, None),
                    e,
                )
            })?;
        Ok(result.rows_affected())
    }
}
