use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{SchedulerInstanceRecord, SchedulerInstanceRepository, SchedulerInstanceState};
use scheduler_errors::SchedulerResult;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "调度实例";

pub struct SqliteInstanceRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteInstanceRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, instance_id: Option<&str>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match instance_id {
            Some(id) => ctx.with_key(id),
            None => ctx,
        }
    }

    fn row_to_record(row: &SqliteRow) -> SchedulerResult<SchedulerInstanceRecord> {
        Ok(SchedulerInstanceRecord {
            instance_name: row.try_get("sched_name")?,
            instance_id: row.try_get("instance_id")?,
            state: MappingHelpers::parse_enum(row, "state")?,
            last_checkin_time: MappingHelpers::time(row, "last_checkin_time")?,
            checkin_interval_ms: row.try_get("checkin_interval")?,
        })
    }
}

#[async_trait]
impl SchedulerInstanceRepository for SqliteInstanceRepository {
    async fn upsert(&self, record: &SchedulerInstanceRecord) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO js_scheduler_state (sched_name, instance_id, state, last_checkin_time, checkin_interval)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (sched_name, instance_id) DO UPDATE SET
                state = excluded.state,
                last_checkin_time = excluded.last_checkin_time,
                checkin_interval = excluded.checkin_interval
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.instance_id)
        .bind(record.state.as_str())
        .bind(MappingHelpers::to_millis(record.last_checkin_time))
        .bind(record.checkin_interval_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(&record.instance_id)),
                e,
            )
        })?;

        debug!(
            "登记调度实例: {} ({})",
            record.instance_id,
            record.state.as_str()
        );
        Ok(())
    }

    async fn update_state(
        &self,
        instance_id: &str,
        state: SchedulerInstanceState,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE js_scheduler_state SET state = $3 WHERE sched_name = $1 AND instance_id = $2",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(instance_id)),
                e,
            )
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_checkin(
        &self,
        instance_id: &str,
        checkin_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE js_scheduler_state SET last_checkin_time = $3 WHERE sched_name = $1 AND instance_id = $2",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .bind(MappingHelpers::to_millis(checkin_time))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(instance_id)),
                e,
            )
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, instance_id: &str) -> SchedulerResult<bool> {
        let result =
            sqlx::query("DELETE FROM js_scheduler_state WHERE sched_name = $1 AND instance_id = $2")
                .bind(&self.sched_name)
                .bind(instance_id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryErrorHelpers::database_error(
                        Self::ctx(RepositoryOperation::Delete, Some(instance_id)),
                        e,
                    )
                })?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_all(&self) -> SchedulerResult<Vec<SchedulerInstanceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM js_scheduler_state WHERE sched_name = $1 ORDER BY instance_id",
        )
        .bind(&self.sched_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        rows.iter().map(Self::row_to_record).collect()
    }
}
