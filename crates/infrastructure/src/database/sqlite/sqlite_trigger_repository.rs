use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    GroupMatcher, JobKey, MisfireInstruction, ScheduleRecord, TriggerKey, TriggerRecord,
    TriggerRepository, TriggerState,
};
use scheduler_errors::SchedulerResult;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::database::mapping::MappingHelpers;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const ENTITY: &str = "触发器";

const TRIGGER_COLUMNS: &str = "sched_name, trigger_name, trigger_group, job_name, job_group, \
    description, next_fire_time, prev_fire_time, priority, trigger_state, start_time, end_time, \
    calendar_name, misfire_instr, job_data, schedule_kind, schedule_data";

pub struct SqliteTriggerRepository {
    pool: SqlitePool,
    sched_name: String,
}

impl SqliteTriggerRepository {
    pub fn new(pool: SqlitePool, sched_name: impl Into<String>) -> Self {
        Self {
            pool,
            sched_name: sched_name.into(),
        }
    }

    fn ctx(operation: RepositoryOperation, key: Option<&TriggerKey>) -> StoreOperationContext {
        let ctx = StoreOperationContext::new(operation, ENTITY);
        match key {
            Some(key) => ctx.with_key(key),
            None => ctx,
        }
    }

    fn row_to_trigger(row: &SqliteRow) -> SchedulerResult<TriggerRecord> {
        let kind: String = row.try_get("schedule_kind")?;
        let data: String = row.try_get("schedule_data")?;
        let key = TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        );
        let schedule = ScheduleRecord::decode(&kind, &data)
            .map_err(|e| e.with_context(format!("读取触发器 {key} 的调度数据")))?;

        Ok(TriggerRecord {
            scheduler_name: row.try_get("sched_name")?,
            job_key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            description: row.try_get("description")?,
            state: MappingHelpers::parse_enum(row, "trigger_state")?,
            priority: row.try_get("priority")?,
            next_fire_time: MappingHelpers::opt_time(row, "next_fire_time")?,
            previous_fire_time: MappingHelpers::opt_time(row, "prev_fire_time")?,
            start_time: MappingHelpers::time(row, "start_time")?,
            end_time: MappingHelpers::opt_time(row, "end_time")?,
            calendar_name: row.try_get("calendar_name")?,
            misfire_instruction: MappingHelpers::parse_enum::<MisfireInstruction>(
                row,
                "misfire_instr",
            )?,
            job_data: MappingHelpers::parse_json(row, "job_data")?,
            schedule,
            key,
        })
    }

    fn rows_to_triggers(rows: &[SqliteRow]) -> SchedulerResult<Vec<TriggerRecord>> {
        rows.iter().map(Self::row_to_trigger).collect()
    }

    fn rows_to_keys(rows: &[SqliteRow]) -> SchedulerResult<Vec<TriggerKey>> {
        rows.iter()
            .map(|row| -> SchedulerResult<TriggerKey> {
                Ok(TriggerKey::new(
                    row.try_get::<String, _>("trigger_name")?,
                    row.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    async fn execute_update(
        &self,
        mut builder: QueryBuilder<'_, Sqlite>,
        key: Option<&TriggerKey>,
    ) -> SchedulerResult<u64> {
        let result = builder.build().execute(&self.pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::BatchUpdate, key), e)
        })?;
        Ok(result.rows_affected())
    }

    async fn fetch_triggers(
        &self,
        mut builder: QueryBuilder<'_, Sqlite>,
    ) -> SchedulerResult<Vec<TriggerRecord>> {
        let rows = builder.build().fetch_all(&self.pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_triggers(&rows)
    }

    fn update_state_builder(&self, state: TriggerState) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE js_triggers SET trigger_state = ");
        builder.push_bind(state.as_str());
        builder.push(" WHERE sched_name = ");
        builder.push_bind(&self.sched_name);
        builder
    }
}

#[async_trait]
impl TriggerRepository for SqliteTriggerRepository {
    async fn insert(&self, trigger: &TriggerRecord) -> SchedulerResult<()> {
        let job_data = serde_json::to_string(&trigger.job_data)?;
        let schedule_data = trigger.schedule.to_json()?;

        sqlx::query(&format!(
            "INSERT INTO js_triggers ({TRIGGER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(&self.sched_name)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(MappingHelpers::opt_to_millis(trigger.next_fire_time))
        .bind(MappingHelpers::opt_to_millis(trigger.previous_fire_time))
        .bind(trigger.priority)
        .bind(trigger.state.as_str())
        .bind(MappingHelpers::to_millis(trigger.start_time))
        .bind(MappingHelpers::opt_to_millis(trigger.end_time))
        .bind(&trigger.calendar_name)
        .bind(trigger.misfire_instruction.as_str())
        .bind(job_data)
        .bind(trigger.schedule.kind_tag())
        .bind(schedule_data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Create, Some(&trigger.key)),
                e,
            )
        })?;

        debug!("创建触发器成功: {} ({})", trigger.key, trigger.state);
        Ok(())
    }

    async fn update(&self, trigger: &TriggerRecord) -> SchedulerResult<bool> {
        let job_data = serde_json::to_string(&trigger.job_data)?;
        let schedule_data = trigger.schedule.to_json()?;

        let result = sqlx::query(
            r#"
            UPDATE js_triggers
            SET job_name = $4, job_group = $5, description = $6, next_fire_time = $7,
                prev_fire_time = $8, priority = $9, trigger_state = $10, start_time = $11,
                end_time = $12, calendar_name = $13, misfire_instr = $14, job_data = $15,
                schedule_kind = $16, schedule_data = $17
            WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3
            "#,
        )
        .bind(&self.sched_name)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(MappingHelpers::opt_to_millis(trigger.next_fire_time))
        .bind(MappingHelpers::opt_to_millis(trigger.previous_fire_time))
        .bind(trigger.priority)
        .bind(trigger.state.as_str())
        .bind(MappingHelpers::to_millis(trigger.start_time))
        .bind(MappingHelpers::opt_to_millis(trigger.end_time))
        .bind(&trigger.calendar_name)
        .bind(trigger.misfire_instruction.as_str())
        .bind(job_data)
        .bind(trigger.schedule.kind_tag())
        .bind(schedule_data)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(
                Self::ctx(RepositoryOperation::Update, Some(&trigger.key)),
                e,
            )
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM js_triggers \
             WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3"
        ))
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(key)), e)
        })?;

        row.as_ref().map(Self::row_to_trigger).transpose()
    }

    async fn exists(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        Ok(self.state(key).await?.is_some())
    }

    async fn delete(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM js_triggers WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
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
            debug!("删除触发器成功: {}", key);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM js_triggers WHERE sched_name = $1")
            .bind(&self.sched_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
            })?;
        Ok(count as usize)
    }

    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<TriggerKey>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT trigger_name, trigger_group FROM js_triggers WHERE sched_name = ",
        );
        builder.push_bind(&self.sched_name);
        MappingHelpers::push_group_filter(&mut builder, "trigger_group", matcher);
        builder.push(" ORDER BY trigger_group, trigger_name");

        let rows = builder.build().fetch_all(&self.pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_keys(&rows)
    }

    async fn group_names(&self) -> SchedulerResult<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT trigger_group FROM js_triggers WHERE sched_name = $1 ORDER BY trigger_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Ok(groups)
    }

    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<TriggerRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRIGGER_COLUMNS} FROM js_triggers WHERE sched_name = "
        ));
        builder.push_bind(&self.sched_name);
        builder.push(" AND job_name = ");
        builder.push_bind(&job_key.name);
        builder.push(" AND job_group = ");
        builder.push_bind(&job_key.group);
        builder.push(" ORDER BY trigger_group, trigger_name");
        self.fetch_triggers(builder).await
    }

    async fn find_by_calendar(&self, calendar_name: &str) -> SchedulerResult<Vec<TriggerRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRIGGER_COLUMNS} FROM js_triggers WHERE sched_name = "
        ));
        builder.push_bind(&self.sched_name);
        builder.push(" AND calendar_name = ");
        builder.push_bind(calendar_name);
        self.fetch_triggers(builder).await
    }

    async fn state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT trigger_state FROM js_triggers WHERE sched_name = $1 AND trigger_name = $2 AND trigger_group = $3",
        )
        .bind(&self.sched_name)
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Read, Some(key)), e)
        })?;

        state
            .map(|s| {
                s.parse::<TriggerState>().map_err(|e| {
                    RepositoryErrorHelpers::mapping_error(
                        Self::ctx(RepositoryOperation::Read, Some(key)),
                        e,
                    )
                })
            })
            .transpose()
    }

    async fn update_state(&self, key: &TriggerKey, state: TriggerState) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        builder.push(" AND trigger_name = ");
        builder.push_bind(&key.name);
        builder.push(" AND trigger_group = ");
        builder.push_bind(&key.group);
        self.execute_update(builder, Some(key)).await
    }

    async fn update_state_from(
        &self,
        key: &TriggerKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        builder.push(" AND trigger_name = ");
        builder.push_bind(&key.name);
        builder.push(" AND trigger_group = ");
        builder.push_bind(&key.group);
        MappingHelpers::push_state_filter(&mut builder, expected);
        self.execute_update(builder, Some(key)).await
    }

    async fn update_states_for_job(
        &self,
        job_key: &JobKey,
        state: TriggerState,
    ) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        builder.push(" AND job_name = ");
        builder.push_bind(&job_key.name);
        builder.push(" AND job_group = ");
        builder.push_bind(&job_key.group);
        self.execute_update(builder, None).await
    }

    async fn update_states_for_job_from(
        &self,
        job_key: &JobKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        builder.push(" AND job_name = ");
        builder.push_bind(&job_key.name);
        builder.push(" AND job_group = ");
        builder.push_bind(&job_key.group);
        MappingHelpers::push_state_filter(&mut builder, expected);
        self.execute_update(builder, None).await
    }

    async fn update_states_in_group_from(
        &self,
        matcher: &GroupMatcher,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        MappingHelpers::push_group_filter(&mut builder, "trigger_group", matcher);
        MappingHelpers::push_state_filter(&mut builder, expected);
        self.execute_update(builder, None).await
    }

    async fn update_states_from(
        &self,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let mut builder = self.update_state_builder(state);
        MappingHelpers::push_state_filter(&mut builder, expected);
        self.execute_update(builder, None).await
    }

    async fn find_keys_in_states(
        &self,
        states: &[TriggerState],
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT trigger_name, trigger_group FROM js_triggers WHERE sched_name = ",
        );
        builder.push_bind(&self.sched_name);
        MappingHelpers::push_state_filter(&mut builder, states);

        let rows = builder.build().fetch_all(&self.pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Self::rows_to_keys(&rows)
    }

    async fn find_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> SchedulerResult<Vec<TriggerRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRIGGER_COLUMNS} FROM js_triggers WHERE sched_name = "
        ));
        builder.push_bind(&self.sched_name);
        builder.push(" AND trigger_state = ");
        builder.push_bind(TriggerState::Waiting.as_str());
        builder.push(" AND next_fire_time IS NOT NULL AND next_fire_time <= ");
        builder.push_bind(MappingHelpers::to_millis(no_later_than));
        builder.push(" AND (misfire_instr = ");
        builder.push_bind(MisfireInstruction::IgnoreMisfires.as_str());
        builder.push(" OR next_fire_time >= ");
        builder.push_bind(MappingHelpers::to_millis(no_earlier_than));
        builder.push(") ORDER BY next_fire_time ASC, priority DESC LIMIT ");
        builder.push_bind(max_count as i64);
        self.fetch_triggers(builder).await
    }

    async fn find_misfired(
        &self,
        older_than: DateTime<Utc>,
        max_count: Option<usize>,
    ) -> SchedulerResult<Vec<TriggerRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRIGGER_COLUMNS} FROM js_triggers WHERE sched_name = "
        ));
        builder.push_bind(&self.sched_name);
        builder.push(" AND trigger_state = ");
        builder.push_bind(TriggerState::Waiting.as_str());
        builder.push(" AND misfire_instr <> ");
        builder.push_bind(MisfireInstruction::IgnoreMisfires.as_str());
        builder.push(" AND next_fire_time IS NOT NULL AND next_fire_time < ");
        builder.push_bind(MappingHelpers::to_millis(older_than));
        builder.push(" ORDER BY next_fire_time ASC, priority DESC");
        if let Some(max) = max_count {
            builder.push(" LIMIT ");
            builder.push_bind(max as i64);
        }
        self.fetch_triggers(builder).await
    }

    async fn count_misfired(&self, older_than: DateTime<Utc>) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM js_triggers
            WHERE sched_name = $1 AND trigger_state = $2 AND misfire_instr <> $3
              AND next_fire_time IS NOT NULL AND next_fire_time < $4
            "#,
        )
        .bind(&self.sched_name)
        .bind(TriggerState::Waiting.as_str())
        .bind(MisfireInstruction::IgnoreMisfires.as_str())
        .bind(MappingHelpers::to_millis(older_than))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            RepositoryErrorHelpers::database_error(Self::ctx(RepositoryOperation::Query, None), e)
        })?;
        Ok(count as usize)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM js_triggers WHERE sched_name = $1")
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
