use sqlx::SqlitePool;
use tracing::debug;

use scheduler_errors::SchedulerResult;

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation, StoreOperationContext};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS js_job_details (
        sched_name TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        job_type TEXT NOT NULL,
        description TEXT,
        is_durable INTEGER NOT NULL,
        is_nonconcurrent INTEGER NOT NULL,
        is_update_data INTEGER NOT NULL,
        requests_recovery INTEGER NOT NULL,
        job_data TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (sched_name, job_name, job_group)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_triggers (
        sched_name TEXT NOT NULL,
        trigger_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        description TEXT,
        next_fire_time INTEGER,
        prev_fire_time INTEGER,
        priority INTEGER NOT NULL,
        trigger_state TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        calendar_name TEXT,
        misfire_instr TEXT NOT NULL,
        job_data TEXT NOT NULL DEFAULT '{}',
        schedule_kind TEXT NOT NULL,
        schedule_data TEXT NOT NULL,
        PRIMARY KEY (sched_name, trigger_name, trigger_group)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_js_triggers_state_fire_time
        ON js_triggers (sched_name, trigger_state, next_fire_time)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_js_triggers_job
        ON js_triggers (sched_name, job_name, job_group)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_fired_triggers (
        sched_name TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        trigger_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        fired_time INTEGER NOT NULL,
        sched_time INTEGER,
        priority INTEGER NOT NULL,
        state TEXT NOT NULL,
        is_nonconcurrent INTEGER NOT NULL,
        requests_recovery INTEGER NOT NULL,
        PRIMARY KEY (sched_name, entry_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_js_fired_triggers_instance
        ON js_fired_triggers (sched_name, instance_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_calendars (
        sched_name TEXT NOT NULL,
        calendar_name TEXT NOT NULL,
        calendar TEXT NOT NULL,
        PRIMARY KEY (sched_name, calendar_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_paused_trigger_grps (
        sched_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        PRIMARY KEY (sched_name, trigger_group)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_scheduler_state (
        sched_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        state TEXT NOT NULL,
        last_checkin_time INTEGER NOT NULL,
        checkin_interval INTEGER NOT NULL,
        PRIMARY KEY (sched_name, instance_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS js_locks (
        sched_name TEXT NOT NULL,
        lock_name TEXT NOT NULL,
        owner_instance_id TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        PRIMARY KEY (sched_name, lock_name)
    )
    "#,
];

/// 创建作业存储使用的全部表和索引，可重复执行
pub async fn migrate(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("Running SQLite job store migrations");

    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(
                StoreOperationContext::new(RepositoryOperation::Migrate, "数据库结构"),
                e,
            )
        })?;
    }

    debug!("SQLite job store migrations completed");
    Ok(())
}
