use async_trait::async_trait;
use scheduler_domain::PausedTriggerGroupRepository;
use scheduler_errors::SchedulerResult;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "暂停的触发器分组";

pub struct SqlitePausedGroupRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqlitePausedGroupRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, group: Option<&str>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match group {
            Some(group) => ctx.with_key(group),
            None => ctx,
        }
    }
}

#[async_trait]
impl PausedTriggerGroupRepository for SqlitePausedGroupRepository {
    async fn insert(&self, group: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO js_paused_trigger_grps (sched_name, trigger_group) VALUES ($1, $2)
            ON CONFLICT (sched_name, trigger_group) DO NOTHING
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, Some(group)),
                e,
            )
        })?;

        if result.rows_affected() > 0 {
            debug!("记录暂停分组: {}", group);
        }
        Ok(())
    }

    async fn delete(&self, group: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM js_paused_trigger_grps WHERE sched_name = $1 AND trigger_group = $2",
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Delete, Some(group)),
                e,
            )
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, group: &str) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM js_paused_trigger_grps WHERE sched_name = $1 AND trigger_group = $2",
        )
        .bind(&self.sched_name)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(group)), e)
        })?;
        Ok(count > 0)
    }

    async fn all(&self) -> SchedulerResult<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            "SELECT trigger_group FROM js_paused_trigger_grps WHERE sched_name = $1 ORDER BY trigger_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Ok(groups)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM js_paused_trigger_grps WHERE sched_name = $1")
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
