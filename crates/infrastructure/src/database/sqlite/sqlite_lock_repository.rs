use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{LockRecord, LockRepository, LockType};
use scheduler_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "集群锁";

/// 基于主键冲突实现的集群锁
///
/// 同一 `(sched_name, lock_name)` 只能存在一行，插入成功即获得锁。
pub struct SqliteLockRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteLockRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, lock_type: LockType) -> StoreOperationContext {
        StoreOperationContext::new(operation, ENTITY).with_key(lock_type)
    }
}

#[async_trait]
impl LockRepository for SqliteLockRepository {
    async fn try_insert(&self, lock: &LockRecord) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO js_locks (sched_name, lock_name, owner_instance_id, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sched_name, lock_name) DO NOTHING
            "#,
        )
        .bind(&self.sched_name)
        .bind(lock.lock_type.as_str())
        .bind(&lock.owner_instance_id)
        .bind(MappingHelpers::to_millis(lock.acquired_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, lock.lock_type),
                e,
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, lock_type: LockType, owner_instance_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM js_locks WHERE sched_name = $1 AND lock_name = $2 AND owner_instance_id = $3",
        )
        .bind(&self.sched_name)
        .bind(lock_type.as_str())
        .bind(owner_instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Delete, lock_type), e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, lock_type: LockType) -> SchedulerResult<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT owner_instance_id, acquired_at FROM js_locks WHERE sched_name = $1 AND lock_name = $2",
        )
        .bind(&self.sched_name)
        .bind(lock_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, lock_type), e)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LockRecord {
            instance_name: self.sched_name.clone(),
            lock_type,
            owner_instance_id: row.try_get("owner_instance_id")?,
            acquired_at: MappingHelpers::time(&row, "acquired_at")?,
        }))
    }

    async fn delete_stale(
        &self,
        lock_type: LockType,
        acquired_before: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM js_locks WHERE sched_name = $1 AND lock_name = $2 AND acquired_at < $3",
        )
        .bind(&self.sched_name)
        .bind(lock_type.as_str())
        .bind(MappingHelpers::to_millis(acquired_before))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Delete, lock_type), e)
        })?;
        Ok(result.rows_affected() > 0)
    }
}
