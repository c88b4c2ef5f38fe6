//! 作业存储内部共享状态
//!
//! [`StoreContext`] 由作业存储和错过触发处理器共同持有。这里的 `*_internal`
//! 方法都假定调用方已经持有 `TriggerAccess` 集群锁。

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::JobStoreConfig;
use scheduler_domain::{
    Calendar, FiredTriggerState, JobDetail, JobKey, LockType, StoreRepositories, Trigger,
    TriggerKey, TriggerState, ALL_GROUPS_PAUSED,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::id_generator::FireInstanceIdGenerator;
use crate::lock_manager::{LockGuard, LockManager};
use crate::signaler::{PendingSignals, SchedulerSignaler};
use crate::trigger_factory::TriggerFactory;

/// 一轮错过触发处理的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MisfireRecoveryOutcome {
    /// 本轮达到处理上限，仍有错过触发的触发器
    pub has_more: bool,
    pub processed: usize,
    pub earliest_new_time: Option<DateTime<Utc>>,
}

pub(crate) struct StoreContext {
    pub repos: StoreRepositories,
    pub config: JobStoreConfig,
    pub instance_id: String,
    pub instance_name: String,
    pub lock_manager: LockManager,
    pub ids: FireInstanceIdGenerator,
    pub scheduler_running: AtomicBool,
    pub shutdown: CancellationToken,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
}

impl StoreContext {
    pub fn new(config: JobStoreConfig, instance_id: String, repos: StoreRepositories) -> Self {
        let lock_manager = LockManager::new(
            repos.locks.clone(),
            config.instance_name.clone(),
            instance_id.clone(),
            config.lock_retry_interval(),
            config.lock_ttl(),
        );
        Self {
            instance_name: config.instance_name.clone(),
            ids: FireInstanceIdGenerator::new(instance_id.clone()),
            instance_id,
            lock_manager,
            repos,
            config,
            scheduler_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            signaler: OnceLock::new(),
        }
    }

    pub fn set_signaler(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()> {
        self.signaler
            .set(signaler)
            .map_err(|_| SchedulerError::config_error("作业存储已经初始化"))
    }

    pub fn signaler(&self) -> Option<&Arc<dyn SchedulerSignaler>> {
        self.signaler.get()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler_running.load(Ordering::SeqCst)
    }

    pub async fn lock(&self, lock_type: LockType) -> SchedulerResult<LockGuard> {
        self.lock_manager.acquire(lock_type, &self.shutdown).await
    }

    /// 释放锁，成功时投递锁内收集的通知
    ///
    /// 返回值只取决于操作本身，释放失败只记录日志。遗留的锁记录会在
    /// 本实例下次加锁时被清理，其他实例则等待其超过 TTL。
    pub async fn complete<T>(
        &self,
        guard: LockGuard,
        signals: PendingSignals,
        result: SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let lock_type = guard.lock_type();
        let released = guard.release().await;
        let result = match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(value), Err(release_error)) => {
                warn!("释放集群锁 {} 失败: {}", lock_type, release_error);
                Ok(value)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!("释放集群锁 {} 失败: {}", lock_type, release_error);
                Err(e)
            }
        };
        if result.is_ok() {
            signals.dispatch(self.signaler()).await;
        }
        result
    }

    pub fn misfire_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.misfire_threshold())
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// 下次触发时间早于该时刻的触发器视为错过触发
    pub fn misfire_time(&self) -> DateTime<Utc> {
        Utc::now() - self.misfire_threshold()
    }

    pub async fn load_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.repos
            .triggers
            .find(key)
            .await?
            .map(TriggerFactory::from_record)
            .transpose()
    }

    pub async fn load_calendar(&self, name: Option<&str>) -> SchedulerResult<Option<Calendar>> {
        match name {
            Some(name) => self.repos.calendars.find(name).await,
            None => Ok(None),
        }
    }

    /// 分组是否暂停；所有分组暂停时顺便登记该分组
    pub async fn should_pause_group(&self, group: &str) -> SchedulerResult<bool> {
        if self.repos.paused_groups.exists(group).await? {
            return Ok(true);
        }
        if self.repos.paused_groups.exists(ALL_GROUPS_PAUSED).await? {
            self.repos.paused_groups.insert(group).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// 作业正在执行且禁止并发时，`Waiting`/`Paused` 分别变为 `Blocked`/`PausedBlocked`
    pub async fn check_blocked_state(
        &self,
        job_key: &JobKey,
        current: TriggerState,
    ) -> SchedulerResult<TriggerState> {
        if !matches!(current, TriggerState::Waiting | TriggerState::Paused) {
            return Ok(current);
        }
        let executing = self
            .repos
            .fired_triggers
            .find_by_job(job_key)
            .await?
            .iter()
            .any(|r| r.state == FiredTriggerState::Executing && r.concurrent_execution_disallowed);
        if !executing {
            return Ok(current);
        }
        Ok(match current {
            TriggerState::Paused => TriggerState::PausedBlocked,
            _ => TriggerState::Blocked,
        })
    }

    /// 写入触发器
    ///
    /// `force_state` 为 false 时按分组暂停情况调整状态；
    /// 恢复过程中不检查作业是否被阻塞。
    pub async fn store_trigger_internal(
        &self,
        trigger: &Trigger,
        job: Option<&JobDetail>,
        replace_existing: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> SchedulerResult<()> {
        let exists = self.repos.triggers.exists(&trigger.key).await?;
        if exists && !replace_existing {
            return Err(SchedulerError::already_exists("触发器", trigger.key.to_string()));
        }

        let mut state = state;
        if !force_state
            && matches!(state, TriggerState::Waiting | TriggerState::Acquired)
            && self.should_pause_group(&trigger.key.group).await?
        {
            state = TriggerState::Paused;
        }

        let concurrent_execution_disallowed = match job {
            Some(job) => job.concurrent_execution_disallowed,
            None => {
                self.repos
                    .jobs
                    .find(&trigger.job_key)
                    .await?
                    .ok_or_else(|| SchedulerError::job_not_found(trigger.job_key.to_string()))?
                    .concurrent_execution_disallowed
            }
        };
        if concurrent_execution_disallowed && !recovering {
            state = self.check_blocked_state(&trigger.job_key, state).await?;
        }

        let record = TriggerFactory::to_record(trigger, state, &self.instance_name);
        if exists {
            self.repos.triggers.update(&record).await?;
        } else {
            self.repos.triggers.insert(&record).await?;
        }
        debug!("写入触发器 {} 状态 {}", trigger.key, state);
        Ok(())
    }

    /// 删除触发器，作业非持久且没有剩余触发器时一并删除
    pub async fn remove_trigger_internal(
        &self,
        key: &TriggerKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<bool> {
        let Some(record) = self.repos.triggers.find(key).await? else {
            return Ok(false);
        };
        let removed = self.repos.triggers.delete(key).await?;
        if removed {
            self.delete_orphaned_job(&record.job_key, signals).await?;
        }
        Ok(removed)
    }

    pub async fn delete_orphaned_job(
        &self,
        job_key: &JobKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        let Some(job) = self.repos.jobs.find(job_key).await? else {
            return Ok(());
        };
        if job.durable || !self.repos.triggers.find_by_job(job_key).await?.is_empty() {
            return Ok(());
        }
        if self.repos.jobs.delete(job_key).await? {
            debug!("作业 {} 已没有触发器，随之删除", job_key);
            signals.job_deleted(job_key);
        }
        Ok(())
    }

    /// 单个触发器已错过触发时立即修正，返回是否做了修正
    pub async fn update_misfired_trigger(
        &self,
        key: &TriggerKey,
        new_state: TriggerState,
        force_state: bool,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<bool> {
        let Some(trigger) = self.load_trigger(key).await? else {
            return Ok(false);
        };
        let misfire_time = self.misfire_time();
        match trigger.next_fire_time {
            Some(next) if next <= misfire_time => {}
            _ => return Ok(false),
        }
        self.do_update_of_misfired_trigger(trigger, force_state, new_state, false, signals)
            .await?;
        Ok(true)
    }

    /// 按错过触发策略修正触发器，返回新的下次触发时间
    pub async fn do_update_of_misfired_trigger(
        &self,
        mut trigger: Trigger,
        force_state: bool,
        new_state: TriggerState,
        recovering: bool,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let calendar = self.load_calendar(trigger.calendar_name.as_deref()).await?;
        signals.misfired(&trigger);
        trigger.update_after_misfire(calendar.as_ref(), Utc::now());
        counter!("jobstore_misfires_handled_total").increment(1);

        match trigger.next_fire_time {
            None => {
                self.store_trigger_internal(
                    &trigger,
                    None,
                    true,
                    TriggerState::Complete,
                    force_state,
                    recovering,
                )
                .await?;
                signals.finalized(&trigger);
                debug!("触发器 {} 错过触发后不再触发，标记为完成", trigger.key);
            }
            Some(next) => {
                self.store_trigger_internal(&trigger, None, true, new_state, force_state, false)
                    .await?;
                debug!("触发器 {} 错过触发，下次触发时间修正为 {}", trigger.key, next);
            }
        }
        Ok(trigger.next_fire_time)
    }

    /// 修正错过触发的 `Waiting` 触发器
    ///
    /// 启动恢复时不限制数量，否则每轮最多处理 `max_misfires_to_handle_at_a_time` 个。
    pub async fn recover_misfired_triggers(
        &self,
        recovering: bool,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<MisfireRecoveryOutcome> {
        let limit = self.config.max_misfires_to_handle_at_a_time;
        let fetch = (!recovering).then_some(limit + 1);
        let mut misfired = self
            .repos
            .triggers
            .find_misfired(self.misfire_time(), fetch)
            .await?;

        let has_more = !recovering && misfired.len() > limit;
        if has_more {
            misfired.truncate(limit);
            info!("错过触发的触发器数量超过单轮上限 {}，剩余的下一轮处理", limit);
        }
        if misfired.is_empty() {
            return Ok(MisfireRecoveryOutcome::default());
        }
        info!("处理 {} 个错过触发的触发器", misfired.len());

        let mut outcome = MisfireRecoveryOutcome {
            has_more,
            ..MisfireRecoveryOutcome::default()
        };
        for record in misfired {
            let trigger = TriggerFactory::from_record(record)?;
            let next = self
                .do_update_of_misfired_trigger(
                    trigger,
                    false,
                    TriggerState::Waiting,
                    recovering,
                    signals,
                )
                .await?;
            outcome.processed += 1;
            if let Some(next) = next {
                outcome.earliest_new_time = Some(match outcome.earliest_new_time {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }
        Ok(outcome)
    }
}
