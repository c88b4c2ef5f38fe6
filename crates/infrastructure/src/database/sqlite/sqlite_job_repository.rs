use async_trait::async_trait;
use scheduler_domain::{GroupMatcher, JobDataMap, JobDetail, JobKey, JobRepository};
use scheduler_errors::SchedulerResult;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "作业";

pub struct SqliteJobRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, key: Option<&JobKey>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match key {
            Some(key) => ctx.with_key(key),
            None => ctx,
        }
    }

    fn row_to_job(row: &SqliteRow) -> SchedulerResult<JobDetail> {
        Ok(JobDetail {
            key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            job_type: row.try_get("job_type")?,
            description: row.try_get("description")?,
            durable: row.try_get("is_durable")?,
            concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
            persist_job_data_after_execution: row.try_get("is_update_data")?,
            requests_recovery: row.try_get("requests_recovery")?,
            job_data: MappingHelpers::parse_json(row, "job_data")?,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, job: &JobDetail) -> SchedulerResult<()> {
        let job_data = serde_json::to_string(&job.job_data)?;

        sqlx::query(
            r#"
            INSERT INTO js_job_details (sched_name, job_name, job_group, job_type, description,
                is_durable, is_nonconcurrent, is_update_data, requests_recovery, job_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_job_data_after_execution)
        .bind(job.requests_recovery)
        .bind(job_data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, Some(&job.key)),
                e,
            )
        })?;

        debug!("创建作业成功: {}", job.key);
        Ok(())
    }

    async fn update(&self, job: &JobDetail) -> SchedulerResult<bool> {
        let job_data = serde_json::to_string(&job.job_data)?;

        let result = sqlx::query(
            r#"
            UPDATE js_job_details
            SET job_type = $4, description = $5, is_durable = $6, is_nonconcurrent = $7,
                is_update_data = $8, requests_recovery = $9, job_data = $10
            WHERE sched_name = $1 AND job_name = $2 AND job_group = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_job_data_after_execution)
        .bind(job.requests_recovery)
        .bind(job_data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(&job.key)),
                e,
            )
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        let row = sqlx::query(
            "SELECT * FROM js_job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(key)), e)
        })?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn exists(&self, key: &JobKey) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM js_job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(key)), e)
        })?;

        Ok(count > 0)
    }

    async fn delete(&self, key: &JobKey) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM js_job_details WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Delete, Some(key)),
                e,
            )
        })?;

        if result.rows_affected() > 0 {
            debug!("删除作业成功: {}", key);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> SchedulerResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM js_job_details WHERE sched_name = $1")
                .bind(&self.sched_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryErrorHelpers::database_error(
                        Self::ctx(RepositoryOperation::Query, None),
                        e,
                    )
                })?;
        Ok(count as usize)
    }

    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<JobKey>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT job_name, job_group FROM js_job_details WHERE sched_name = ",
        );
        builder.push_bind(&self.sched_name);
        MappingHelpers::push_group_filter(&mut builder, "job_group", matcher);
        builder.push(" ORDER BY job_group, job_name");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
            })?;

        rows.iter()
            .map(|row| -> SchedulerResult<JobKey> {
                Ok(JobKey::new(
                    row.try_get::<String, _>("job_name")?,
                    row.try_get::<String, _>("job_group")?,
                ))
            })
            .collect()
    }

    async fn group_names(&self) -> SchedulerResult<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT job_group FROM js_job_details WHERE sched_name = $1 ORDER BY job_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Ok(groups)
    }

    async fn update_job_data(&self, key: &JobKey, data: &JobDataMap) -> SchedulerResult<bool> {
        let job_data = serde_json::to_string(data)?;
        let result = sqlx::query(
            "UPDATE js_job_details SET job_data = $4 WHERE sched_name = $1 AND job_name = $2 AND job_group = $3",
        )
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .bind(job_data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(key)),
                e,
            )
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM js_job_details WHERE sched_name = $1")
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
