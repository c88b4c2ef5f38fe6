use async_trait::async_trait;
use scheduler_domain::{FiredTriggerRecord, FiredTriggerRepository, JobKey, TriggerKey};
use scheduler_errors::SchedulerResult;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "已触发记录";

const FIRED_COLUMNS: &str = "entry_id, trigger_name, trigger_group, job_name, job_group, \
    instance_id, fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery";

pub struct SqliteFiredTriggerRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteFiredTriggerRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, key: Option<&str>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match key {
            Some(key) => ctx.with_key(key),
            None => ctx,
        }
    }

    fn row_to_record(row: &SqliteRow) -> SchedulerResult<FiredTriggerRecord> {
        Ok(FiredTriggerRecord {
            entry_id: row.try_get("entry_id")?,
            trigger_key: TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            ),
            job_key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            instance_id: row.try_get("instance_id")?,
            fired_at: MappingHelpers::time(row, "fired_time")?,
            scheduled_at: MappingHelpers::opt_time(row, "sched_time")?,
            priority: row.try_get("priority")?,
            state: MappingHelpers::parse_enum(row, "state")?,
            concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
            requests_recovery: row.try_get("requests_recovery")?,
        })
    }

    fn rows_to_records(rows: &[SqliteRow]) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        rows.iter().map(Self::row_to_record).collect()
    }
}

#[async_trait]
impl FiredTriggerRepository for SqliteFiredTriggerRepository {
    async fn insert(&self, record: &FiredTriggerRecord) -> SchedulerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO js_fired_triggers (sched_name, {FIRED_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(&self.sched_name)
        .bind(&record.entry_id)
        .bind(&record.trigger_key.name)
        .bind(&record.trigger_key.group)
        .bind(&record.job_key.name)
        .bind(&record.job_key.group)
        .bind(&record.instance_id)
        .bind(MappingHelpers::to_millis(record.fired_at))
        .bind(MappingHelpers::opt_to_millis(record.scheduled_at))
        .bind(record.priority)
        .bind(record.state.as_str())
        .bind(record.concurrent_execution_disallowed)
        .bind(record.requests_recovery)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, Some(&record.entry_id)),
                e,
            )
        })?;

        debug!(
            "记录已触发触发器: {} -> {} ({})",
            record.trigger_key,
            record.entry_id,
            record.state.as_str()
        );
        Ok(())
    }

    async fn update(&self, record: &FiredTriggerRecord) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE js_fired_triggers
            SET trigger_name = $3, trigger_group = $4, job_name = $5, job_group = $6,
                instance_id = $7, fired_time = $8, sched_time = $9, priority = $10, state = $11,
                is_nonconcurrent = $12, requests_recovery = $13
            WHERE sched_name = $1 AND entry_id = $2
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.entry_id)
        .bind(&record.trigger_key.name)
        .bind(&record.trigger_key.group)
        .bind(&record.job_key.name)
        .bind(&record.job_key.group)
        .bind(&record.instance_id)
        .bind(MappingHelpers::to_millis(record.fired_at))
        .bind(MappingHelpers::opt_to_millis(record.scheduled_at))
        .bind(record.priority)
        .bind(record.state.as_str())
        .bind(record.concurrent_execution_disallowed)
        .bind(record.requests_recovery)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(&record.entry_id)),
                e,
            )
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_instance(&self, instance_id: &str) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FIRED_COLUMNS} FROM js_fired_triggers \
             WHERE sched_name = $1 AND instance_id = $2 ORDER BY fired_time"
        ))
        .bind(&self.sched_name)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_records(&rows)
    }

    async fn find_by_trigger(&self, key: &TriggerKey) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FIRED_COLUMNS} FROM js_fired_triggers \
             WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3 ORDER BY fired_time"
        ))
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_records(&rows)
    }

    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {FIRED_COLUMNS} FROM js_fired_triggers \
             WHERE sched_name = $1 AND job_name = $2 AND job_group = $3 ORDER BY fired_time"
        ))
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_records(&rows)
    }

    async fn delete(&self, entry_id: &str) -> SchedulerResult<bool> {
        let result =
            sqlx::query("DELETE FROM js_fired_triggers WHERE sched_name = $1 AND entry_id = $2")
                .bind(&self.sched_name)
                .bind(entry_id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryErrorHelpers::database_error(
                        Self::ctx(RepositoryOperation::Delete, Some(entry_id)),
                        e,
                    )
                })?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_instance(&self, instance_id: &str) -> SchedulerResult<u64> {
        let result =
            sqlx::query("DELETE FROM js_fired_triggers WHERE sched_name = $1 AND instance_id = $2")
                .bind(&self.sched_name)
                .bind(instance_id)
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

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM js_fired_triggers WHERE sched_name = $1")
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
