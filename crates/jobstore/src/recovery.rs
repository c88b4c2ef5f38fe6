//! 启动恢复
//!
//! 实例启动时在 `TriggerAccess` 锁内执行一次：
//!
//! 1. 把上次运行遗留的 `Acquired`/`Blocked` 触发器恢复为 `Waiting`，`PausedBlocked` 恢复为 `Paused`
//! 2. 不限数量地修正错过触发
//! 3. 为本实例执行中崩溃且要求恢复的作业创建一次性恢复触发器
//! 4. 删除已完成的触发器
//! 5. 删除本实例的全部已触发记录

use scheduler_domain::{
    FiredTriggerState, LockType, MisfireInstruction, Schedule, Trigger, TriggerState,
};
use scheduler_errors::SchedulerResult;
use tracing::{info, warn};

use crate::context::StoreContext;
use crate::signaler::PendingSignals;

/// 恢复触发器作业数据中记录原触发器名称的键
pub const FAILED_JOB_ORIGINAL_TRIGGER_NAME: &str = "failed_job_original_trigger_name";
pub const FAILED_JOB_ORIGINAL_TRIGGER_GROUP: &str = "failed_job_original_trigger_group";
/// 原触发时间，毫秒时间戳
pub const FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS: &str =
    "failed_job_original_trigger_firetime_in_milliseconds";
pub const FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS: &str =
    "failed_job_original_trigger_scheduled_firetime_in_milliseconds";

/// 启动恢复的统计结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset_triggers: u64,
    pub misfired_triggers: usize,
    pub recovery_triggers: usize,
    pub completed_triggers_removed: usize,
    pub fired_records_deleted: u64,
}

pub(crate) async fn recover_jobs(ctx: &StoreContext) -> SchedulerResult<RecoveryReport> {
    let guard = ctx.lock(LockType::TriggerAccess).await?;
    let mut signals = PendingSignals::new();
    let result = recover_jobs_locked(ctx, &mut signals).await;
    ctx.complete(guard, signals, result).await
}

async fn recover_jobs_locked(
    ctx: &StoreContext,
    signals: &mut PendingSignals,
) -> SchedulerResult<RecoveryReport> {
    let repos = &ctx.repos;
    let mut report = RecoveryReport::default();

    report.reset_triggers = repos
        .triggers
        .update_states_from(
            TriggerState::Waiting,
            &[TriggerState::Acquired, TriggerState::Blocked],
        )
        .await?
        + repos
            .triggers
            .update_states_from(TriggerState::Paused, &[TriggerState::PausedBlocked])
            .await?;
    info!(
        "已将 {} 个触发器从 ACQUIRED/BLOCKED/PAUSED_BLOCKED 恢复",
        report.reset_triggers
    );

    report.misfired_triggers = ctx.recover_misfired_triggers(true, signals).await?.processed;

    let fired = repos.fired_triggers.find_by_instance(&ctx.instance_id).await?;
    for record in fired
        .iter()
        .filter(|r| r.requests_recovery && r.state == FiredTriggerState::Executing)
    {
        if !repos.jobs.exists(&record.job_key).await? {
            warn!(
                "作业 {} 已不存在，跳过对触发器 {} 的恢复",
                record.job_key, record.trigger_key
            );
            continue;
        }

        let mut job_data = ctx
            .load_trigger(&record.trigger_key)
            .await?
            .map(|original| original.job_data)
            .unwrap_or_default();
        job_data.put(
            FAILED_JOB_ORIGINAL_TRIGGER_NAME,
            record.trigger_key.name.clone(),
        );
        job_data.put(
            FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
            record.trigger_key.group.clone(),
        );
        job_data.put(
            FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME_IN_MILLISECONDS,
            record.fired_at.timestamp_millis(),
        );
        if let Some(scheduled_at) = record.scheduled_at {
            job_data.put(
                FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME_IN_MILLISECONDS,
                scheduled_at.timestamp_millis(),
            );
        }

        let mut trigger = Trigger::new(
            ctx.ids.next_recovery_trigger_key(),
            record.job_key.clone(),
            Schedule::once(),
        )
        .starting_at(record.scheduled_at.unwrap_or(record.fired_at))
        .with_priority(record.priority)
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
        .with_job_data(job_data);
        trigger.compute_first_fire_time(None);

        ctx.store_trigger_internal(&trigger, None, false, TriggerState::Waiting, false, true)
            .await?;
        info!(
            "为作业 {} 创建恢复触发器 {}（原触发器 {}）",
            record.job_key, trigger.key, record.trigger_key
        );
        report.recovery_triggers += 1;
    }

    for key in repos
        .triggers
        .find_keys_in_states(&[TriggerState::Complete])
        .await?
    {
        if ctx.remove_trigger_internal(&key, signals).await? {
            report.completed_triggers_removed += 1;
        }
    }

    report.fired_records_deleted = repos
        .fired_triggers
        .delete_by_instance(&ctx.instance_id)
        .await?;

    info!(
        "实例 {} 启动恢复完成: 恢复触发器 {} 个，错过触发 {} 个，清理已完成触发器 {} 个，清理已触发记录 {} 条",
        ctx.instance_id,
        report.recovery_triggers,
        report.misfired_triggers,
        report.completed_triggers_removed,
        report.fired_records_deleted
    );
    Ok(report)
}
