//! 集群作业存储
//!
//! 所有修改操作都在 `TriggerAccess` 集群锁内执行，实例状态维护使用
//! `StateAccess` 锁。锁内产生的通知在释放锁之后投递给调度引擎。
//! 只读查询不加锁。

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::JobStoreConfig;
use scheduler_domain::{
    Calendar, CompletedExecutionInstruction, FiredTriggerRecord, FiredTriggerState, GroupMatcher,
    JobDetail, JobKey, LockType, SchedulerInstanceRecord, SchedulerInstanceState,
    StoreRepositories, Trigger, TriggerFiredBundle, TriggerKey, TriggerState, TriggerStatus,
    ALL_GROUPS_PAUSED, RECOVERING_JOBS_GROUP,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::context::StoreContext;
use crate::misfire_handler::MisfireHandler;
use crate::recovery::{self, RecoveryReport};
use crate::signaler::{PendingSignals, SchedulerSignaler};
use crate::trigger_factory::TriggerFactory;

/// 候选触发器都被其他实例抢走时重新扫描的最大次数
const MAX_DO_LOOP_RETRY: usize = 3;

/// 在 `TriggerAccess` 锁内执行表达式，释放锁后投递通知
macro_rules! in_trigger_lock {
    ($store:expr, |$signals:ident| $body:expr) => {{
        let guard = $store.ctx.lock(LockType::TriggerAccess).await?;
        let mut $signals = PendingSignals::new();
        let result = $body;
        $store.ctx.complete(guard, $signals, result).await
    }};
    ($store:expr, $body:expr) => {{
        let guard = $store.ctx.lock(LockType::TriggerAccess).await?;
        let result = $body;
        $store.ctx.complete(guard, PendingSignals::new(), result).await
    }};
}

pub struct JobStore {
    ctx: Arc<StoreContext>,
    misfire_handler: Mutex<Option<MisfireHandler>>,
}

impl JobStore {
    /// 创建作业存储，校验配置并确定实例ID
    pub fn new(config: JobStoreConfig, repos: StoreRepositories) -> SchedulerResult<Self> {
        config.validate()?;
        let instance_id = config.resolve_instance_id()?;
        info!(
            "创建作业存储: 调度器 {}，实例 {}",
            config.instance_name, instance_id
        );
        Ok(Self {
            ctx: Arc::new(StoreContext::new(config, instance_id, repos)),
            misfire_handler: Mutex::new(None),
        })
    }

    /// 注册调度引擎回调，只能调用一次
    pub fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()> {
        self.ctx.set_signaler(signaler)?;
        debug!("作业存储 {} 已初始化", self.ctx.instance_id);
        Ok(())
    }

    /// 调度引擎启动：登记实例、执行启动恢复、启动错过触发处理器
    #[instrument(skip_all, fields(instance_id = %self.ctx.instance_id))]
    pub async fn scheduler_started(&self) -> SchedulerResult<RecoveryReport> {
        let record = SchedulerInstanceRecord {
            instance_name: self.ctx.instance_name.clone(),
            instance_id: self.ctx.instance_id.clone(),
            state: SchedulerInstanceState::Started,
            last_checkin_time: Utc::now(),
            checkin_interval_ms: i64::try_from(self.ctx.config.cluster_checkin_interval_ms)
                .unwrap_or(i64::MAX),
        };
        let guard = self.ctx.lock(LockType::StateAccess).await?;
        let result = self.ctx.repos.instances.upsert(&record).await;
        self.ctx
            .complete(guard, PendingSignals::new(), result)
            .await
            .map_err(|e| e.with_context("登记调度实例失败"))?;

        let report = recovery::recover_jobs(&self.ctx)
            .await
            .map_err(|e| e.with_context("启动恢复失败"))?;

        self.ctx.scheduler_running.store(true, Ordering::SeqCst);
        let mut handler = self.misfire_handler.lock().await;
        if handler.is_none() {
            *handler = Some(MisfireHandler::spawn(self.ctx.clone()));
        }
        info!("实例 {} 已启动", self.ctx.instance_id);
        Ok(report)
    }

    pub async fn scheduler_paused(&self) -> SchedulerResult<()> {
        self.ctx.scheduler_running.store(false, Ordering::SeqCst);
        self.update_instance_state(SchedulerInstanceState::Paused)
            .await
    }

    pub async fn scheduler_resumed(&self) -> SchedulerResult<()> {
        self.ctx.scheduler_running.store(true, Ordering::SeqCst);
        self.update_instance_state(SchedulerInstanceState::Resumed)
            .await
    }

    async fn update_instance_state(&self, state: SchedulerInstanceState) -> SchedulerResult<()> {
        let guard = self.ctx.lock(LockType::StateAccess).await?;
        let result = self
            .ctx
            .repos
            .instances
            .update_state(&self.ctx.instance_id, state)
            .await
            .map(|_| ());
        self.ctx.complete(guard, PendingSignals::new(), result).await?;
        info!("实例 {} 状态变为 {}", self.ctx.instance_id, state.as_str());
        Ok(())
    }

    /// 停止错过触发处理器并注销实例，重复调用无副作用
    #[instrument(skip_all, fields(instance_id = %self.ctx.instance_id))]
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Ok(());
        }
        self.ctx.scheduler_running.store(false, Ordering::SeqCst);
        if let Some(handler) = self.misfire_handler.lock().await.take() {
            handler.shutdown().await;
        }

        let result = async {
            let guard = self.ctx.lock(LockType::StateAccess).await?;
            let result = self
                .ctx
                .repos
                .instances
                .delete(&self.ctx.instance_id)
                .await
                .map(|_| ());
            self.ctx.complete(guard, PendingSignals::new(), result).await
        }
        .await;
        self.ctx.shutdown.cancel();
        result.map_err(|e| e.with_context("注销调度实例失败"))?;
        info!("实例 {} 已关闭", self.ctx.instance_id);
        Ok(())
    }

    pub fn supports_persistence(&self) -> bool {
        true
    }

    pub fn is_clustered(&self) -> bool {
        true
    }

    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.ctx.instance_name
    }

    /// 调度引擎执行线程数，仅作参考
    pub fn thread_pool_size(&self) -> usize {
        self.ctx.config.thread_pool_size
    }

    pub fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration {
        Duration::from_millis(70)
    }

    // ---------------------------------------------------------------------
    // 作业、触发器、日历的存储
    // ---------------------------------------------------------------------

    /// 校验触发器，尚未计算首次触发时间时按日历计算
    async fn prepare_trigger(&self, trigger: &Trigger) -> SchedulerResult<Trigger> {
        trigger.validate()?;
        let mut trigger = trigger.clone();
        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => Some(
                self.ctx
                    .repos
                    .calendars
                    .find(name)
                    .await?
                    .ok_or_else(|| SchedulerError::calendar_not_found(name))?,
            ),
            None => None,
        };
        if trigger.next_fire_time.is_none()
            && trigger.compute_first_fire_time(calendar.as_ref()).is_none()
        {
            return Err(SchedulerError::invalid_schedule(format!(
                "触发器 {} 永远不会触发",
                trigger.key
            )));
        }
        Ok(trigger)
    }

    #[instrument(skip_all, fields(job = %job.key, trigger = %trigger.key))]
    pub async fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let trigger = self.prepare_trigger(trigger).await?;
        in_trigger_lock!(self, |signals| {
            self.store_job_and_trigger_locked(job, &trigger, &mut signals)
                .await
        })
    }

    async fn store_job_and_trigger_locked(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        self.store_job_locked(job, false).await?;
        self.ctx
            .store_trigger_internal(trigger, Some(job), false, TriggerState::Waiting, false, false)
            .await?;
        signals.scheduling_change(trigger.next_fire_time);
        Ok(())
    }

    #[instrument(skip_all, fields(job = %job.key))]
    pub async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.store_job_locked(job, replace_existing).await
        })
    }

    async fn store_job_locked(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()> {
        let jobs = &self.ctx.repos.jobs;
        if jobs.exists(&job.key).await? {
            if !replace_existing {
                return Err(SchedulerError::already_exists("作业", job.key.to_string()));
            }
            jobs.update(job).await?;
            debug!("更新作业 {}", job.key);
        } else {
            jobs.insert(job).await?;
            debug!("新增作业 {}", job.key);
        }
        Ok(())
    }

    /// 批量存储作业及其触发器
    ///
    /// 不替换时先检查全部对象，任何一个已存在都不做修改。
    #[instrument(skip_all, fields(jobs = jobs_and_triggers.len()))]
    pub async fn store_jobs_and_triggers(
        &self,
        jobs_and_triggers: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()> {
        let mut prepared = Vec::with_capacity(jobs_and_triggers.len());
        for (job, triggers) in jobs_and_triggers {
            let mut ready = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                ready.push(self.prepare_trigger(trigger).await?);
            }
            prepared.push((job, ready));
        }

        in_trigger_lock!(self, |signals| {
            self.store_jobs_and_triggers_locked(&prepared, replace, &mut signals)
                .await
        })
    }

    async fn store_jobs_and_triggers_locked(
        &self,
        prepared: &[(&JobDetail, Vec<Trigger>)],
        replace: bool,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        if !replace {
            for (job, triggers) in prepared {
                if self.ctx.repos.jobs.exists(&job.key).await? {
                    return Err(SchedulerError::already_exists("作业", job.key.to_string()));
                }
                for trigger in triggers {
                    if self.ctx.repos.triggers.exists(&trigger.key).await? {
                        return Err(SchedulerError::already_exists(
                            "触发器",
                            trigger.key.to_string(),
                        ));
                    }
                }
            }
        }

        for (job, triggers) in prepared {
            self.store_job_locked(job, replace).await?;
            for trigger in triggers {
                self.ctx
                    .store_trigger_internal(
                        trigger,
                        Some(*job),
                        replace,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await?;
                signals.scheduling_change(trigger.next_fire_time);
            }
        }
        Ok(())
    }

    /// 删除作业及其全部触发器
    #[instrument(skip_all, fields(job = %key))]
    pub async fn remove_job(&self, key: &JobKey) -> SchedulerResult<bool> {
        in_trigger_lock!(self, |signals| self.remove_job_locked(key, &mut signals).await)
    }

    /// 删除多个作业，全部存在时返回 true；有失败时返回第一个错误
    pub async fn remove_jobs(&self, keys: &[JobKey]) -> SchedulerResult<bool> {
        in_trigger_lock!(self, |signals| {
            let mut all_found = true;
            let mut first_error = None;
            for key in keys {
                match self.remove_job_locked(key, &mut signals).await {
                    Ok(found) => all_found &= found,
                    Err(e) => {
                        warn!("删除作业 {} 失败: {}", key, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(all_found),
            }
        })
    }

    async fn remove_job_locked(
        &self,
        key: &JobKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<bool> {
        let triggers = self.ctx.repos.triggers.find_by_job(key).await?;
        for trigger in &triggers {
            self.ctx.repos.triggers.delete(&trigger.key).await?;
        }
        let removed = self.ctx.repos.jobs.delete(key).await?;
        if removed && !triggers.is_empty() {
            signals.scheduling_change(None);
        }
        debug!("删除作业 {}（{} 个触发器）", key, triggers.len());
        Ok(removed)
    }

    pub async fn retrieve_job(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        self.ctx.repos.jobs.find(key).await
    }

    #[instrument(skip_all, fields(trigger = %trigger.key))]
    pub async fn store_trigger(
        &self,
        trigger: &Trigger,
        replace_existing: bool,
    ) -> SchedulerResult<()> {
        let trigger = self.prepare_trigger(trigger).await?;
        in_trigger_lock!(self, |signals| {
            self.ctx
                .store_trigger_internal(
                    &trigger,
                    None,
                    replace_existing,
                    TriggerState::Waiting,
                    false,
                    false,
                )
                .await
                .map(|()| signals.scheduling_change(trigger.next_fire_time))
        })
    }

    /// 删除触发器，非持久作业失去最后一个触发器时一并删除
    #[instrument(skip_all, fields(trigger = %key))]
    pub async fn remove_trigger(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        in_trigger_lock!(self, |signals| {
            self.ctx.remove_trigger_internal(key, &mut signals).await
        })
    }

    /// 删除多个触发器，全部存在时返回 true；有失败时返回第一个错误
    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> SchedulerResult<bool> {
        in_trigger_lock!(self, |signals| {
            let mut all_found = true;
            let mut first_error = None;
            for key in keys {
                match self.ctx.remove_trigger_internal(key, &mut signals).await {
                    Ok(found) => all_found &= found,
                    Err(e) => {
                        warn!("删除触发器 {} 失败: {}", key, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(all_found),
            }
        })
    }

    /// 用新触发器替换旧触发器，新触发器必须属于同一个作业
    #[instrument(skip_all, fields(trigger = %key))]
    pub async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        let new_trigger = self.prepare_trigger(new_trigger).await?;
        in_trigger_lock!(self, |signals| {
            self.replace_trigger_locked(key, &new_trigger, &mut signals)
                .await
        })
    }

    async fn replace_trigger_locked(
        &self,
        key: &TriggerKey,
        new_trigger: &Trigger,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<bool> {
        let Some(old) = self.ctx.repos.triggers.find(key).await? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(SchedulerError::persistence(format!(
                "新触发器 {} 与旧触发器 {} 不属于同一个作业",
                new_trigger.key, key
            )));
        }
        let job = self
            .ctx
            .repos
            .jobs
            .find(&old.job_key)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(old.job_key.to_string()))?;

        let removed = self.ctx.repos.triggers.delete(key).await?;
        self.ctx
            .store_trigger_internal(
                new_trigger,
                Some(&job),
                false,
                TriggerState::Waiting,
                false,
                false,
            )
            .await?;
        signals.scheduling_change(new_trigger.next_fire_time);
        Ok(removed)
    }

    pub async fn retrieve_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.ctx.load_trigger(key).await
    }

    /// 存储日历；`update_triggers` 为 true 时重新计算引用该日历的触发器
    #[instrument(skip_all, fields(calendar = %name))]
    pub async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        calendar.validate()?;
        in_trigger_lock!(self, |signals| {
            self.store_calendar_locked(
                name,
                calendar,
                replace_existing,
                update_triggers,
                &mut signals,
            )
            .await
        })
    }

    async fn store_calendar_locked(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        let calendars = &self.ctx.repos.calendars;
        if !calendars.exists(name).await? {
            calendars.insert(name, calendar).await?;
            debug!("新增日历 {}", name);
            return Ok(());
        }
        if !replace_existing {
            return Err(SchedulerError::already_exists("日历", name));
        }
        calendars.update(name, calendar).await?;
        if !update_triggers {
            return Ok(());
        }

        let referencing = self.ctx.repos.triggers.find_by_calendar(name).await?;
        let count = referencing.len();
        for record in referencing {
            let state = record.state;
            let mut trigger = TriggerFactory::from_record(record)?;
            trigger.update_with_new_calendar(Some(calendar), self.ctx.misfire_threshold());
            self.ctx
                .store_trigger_internal(&trigger, None, true, state, true, false)
                .await?;
        }
        if count > 0 {
            signals.scheduling_change(None);
        }
        debug!("更新日历 {}，重新计算 {} 个触发器", name, count);
        Ok(())
    }

    /// 删除日历，仍被触发器引用时失败
    #[instrument(skip_all, fields(calendar = %name))]
    pub async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool> {
        in_trigger_lock!(self, {
            self.remove_calendar_locked(name).await
        })
    }

    async fn remove_calendar_locked(&self, name: &str) -> SchedulerResult<bool> {
        if !self
            .ctx
            .repos
            .triggers
            .find_by_calendar(name)
            .await?
            .is_empty()
        {
            return Err(SchedulerError::persistence(format!(
                "日历 '{name}' 仍被触发器引用，不能删除"
            )));
        }
        self.ctx.repos.calendars.delete(name).await
    }

    pub async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        self.ctx.repos.calendars.find(name).await
    }

    /// 清空本调度器名下的全部作业、触发器、日历、暂停分组和已触发记录
    #[instrument(skip_all)]
    pub async fn clear_all_scheduling_data(&self) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.clear_all_locked().await
        })
    }

    async fn clear_all_locked(&self) -> SchedulerResult<()> {
        let repos = &self.ctx.repos;
        let fired = repos.fired_triggers.delete_all().await?;
        let triggers = repos.triggers.delete_all().await?;
        let jobs = repos.jobs.delete_all().await?;
        let calendars = repos.calendars.delete_all().await?;
        repos.paused_groups.delete_all().await?;
        info!(
            "已清空调度数据: 作业 {}，触发器 {}，日历 {}，已触发记录 {}",
            jobs, triggers, calendars, fired
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------------

    pub async fn check_job_exists(&self, key: &JobKey) -> SchedulerResult<bool> {
        self.ctx.repos.jobs.exists(key).await
    }

    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        self.ctx.repos.triggers.exists(key).await
    }

    pub async fn calendar_exists(&self, name: &str) -> SchedulerResult<bool> {
        self.ctx.repos.calendars.exists(name).await
    }

    pub async fn number_of_jobs(&self) -> SchedulerResult<usize> {
        self.ctx.repos.jobs.count().await
    }

    pub async fn number_of_triggers(&self) -> SchedulerResult<usize> {
        self.ctx.repos.triggers.count().await
    }

    pub async fn number_of_calendars(&self) -> SchedulerResult<usize> {
        self.ctx.repos.calendars.count().await
    }

    pub async fn job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<JobKey>> {
        self.ctx.repos.jobs.keys(matcher).await
    }

    pub async fn trigger_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<TriggerKey>> {
        self.ctx.repos.triggers.keys(matcher).await
    }

    pub async fn job_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.ctx.repos.jobs.group_names().await
    }

    pub async fn trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.ctx.repos.triggers.group_names().await
    }

    pub async fn calendar_names(&self) -> SchedulerResult<Vec<String>> {
        self.ctx.repos.calendars.names().await
    }

    pub async fn triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        self.ctx
            .repos
            .triggers
            .find_by_job(job_key)
            .await?
            .into_iter()
            .map(TriggerFactory::from_record)
            .collect()
    }

    /// 对外可见的触发器状态，触发器不存在时为 `None`
    pub async fn trigger_state(&self, key: &TriggerKey) -> SchedulerResult<TriggerStatus> {
        Ok(self
            .ctx
            .repos
            .triggers
            .state(key)
            .await?
            .map_or(TriggerStatus::None, TriggerState::status))
    }

    pub async fn paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>> {
        Ok(self
            .ctx
            .repos
            .paused_groups
            .all()
            .await?
            .into_iter()
            .collect())
    }

    pub async fn is_job_group_paused(&self, _group: &str) -> SchedulerResult<bool> {
        Err(SchedulerError::not_supported("is_job_group_paused"))
    }

    pub async fn is_trigger_group_paused(&self, _group: &str) -> SchedulerResult<bool> {
        Err(SchedulerError::not_supported("is_trigger_group_paused"))
    }

    // ---------------------------------------------------------------------
    // 暂停与恢复
    // ---------------------------------------------------------------------

    #[instrument(skip_all, fields(trigger = %key))]
    pub async fn pause_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.pause_trigger_locked(key).await
        })
    }

    async fn pause_trigger_locked(&self, key: &TriggerKey) -> SchedulerResult<()> {
        let Some(state) = self.ctx.repos.triggers.state(key).await? else {
            return Ok(());
        };
        if let Some(paused) = state.paused() {
            self.ctx
                .repos
                .triggers
                .update_state_from(key, paused, &[state])
                .await?;
            debug!("暂停触发器 {}: {} -> {}", key, state, paused);
        }
        Ok(())
    }

    /// 暂停匹配的触发器分组，返回被暂停的分组名
    ///
    /// 分组名被记录为暂停状态，之后加入该分组的触发器直接以暂停状态存储。
    #[instrument(skip_all, fields(matcher = ?matcher))]
    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        in_trigger_lock!(self, {
            self.pause_trigger_group_locked(matcher).await
        })
    }

    async fn pause_trigger_group_locked(
        &self,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<Vec<String>> {
        let triggers = &self.ctx.repos.triggers;
        triggers
            .update_states_in_group_from(
                matcher,
                TriggerState::Paused,
                &[TriggerState::Acquired, TriggerState::Waiting],
            )
            .await?;
        triggers
            .update_states_in_group_from(
                matcher,
                TriggerState::PausedBlocked,
                &[TriggerState::Blocked],
            )
            .await?;

        let mut groups: Vec<String> = triggers
            .group_names()
            .await?
            .into_iter()
            .filter(|group| matcher.is_match(group))
            .collect();
        if let GroupMatcher::Equals(group) = matcher {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
        for group in &groups {
            self.ctx.repos.paused_groups.insert(group).await?;
        }
        debug!("暂停触发器分组 {:?}", groups);
        Ok(groups)
    }

    #[instrument(skip_all, fields(job = %key))]
    pub async fn pause_job(&self, key: &JobKey) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.pause_job_locked(key).await
        })
    }

    async fn pause_job_locked(&self, key: &JobKey) -> SchedulerResult<()> {
        for trigger in self.ctx.repos.triggers.find_by_job(key).await? {
            self.pause_trigger_locked(&trigger.key).await?;
        }
        Ok(())
    }

    /// 暂停匹配分组中全部作业的触发器，返回涉及的作业分组名
    #[instrument(skip_all, fields(matcher = ?matcher))]
    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        in_trigger_lock!(self, {
            self.pause_jobs_locked(matcher).await
        })
    }

    async fn pause_jobs_locked(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        let mut groups = BTreeSet::new();
        for job_key in self.ctx.repos.jobs.keys(matcher).await? {
            self.pause_job_locked(&job_key).await?;
            groups.insert(job_key.group);
        }
        Ok(groups.into_iter().collect())
    }

    /// 恢复触发器；已错过触发且调度器在运行时立即按错过触发策略修正
    #[instrument(skip_all, fields(trigger = %key))]
    pub async fn resume_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        in_trigger_lock!(self, |signals| {
            self.resume_trigger_locked(key, &mut signals).await
        })
    }

    async fn resume_trigger_locked(
        &self,
        key: &TriggerKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        let Some(record) = self.ctx.repos.triggers.find(key).await? else {
            return Ok(());
        };
        if !matches!(
            record.state,
            TriggerState::Paused | TriggerState::PausedBlocked
        ) {
            return Ok(());
        }

        let new_state = self
            .ctx
            .check_blocked_state(&record.job_key, TriggerState::Waiting)
            .await?;

        let overdue = record.next_fire_time.is_some_and(|next| next < Utc::now());
        let misfired = if self.ctx.is_running() && overdue {
            self.ctx
                .update_misfired_trigger(key, new_state, true, signals)
                .await?
        } else {
            false
        };
        if !misfired {
            self.ctx
                .repos
                .triggers
                .update_state_from(key, new_state, &[record.state])
                .await?;
        }
        debug!("恢复触发器 {} -> {}", key, new_state);
        Ok(())
    }

    /// 恢复匹配的触发器分组，返回涉及的分组名
    #[instrument(skip_all, fields(matcher = ?matcher))]
    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        in_trigger_lock!(self, |signals| {
            self.resume_trigger_group_locked(matcher, &mut signals)
                .await
        })
    }

    async fn resume_trigger_group_locked(
        &self,
        matcher: &GroupMatcher,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<Vec<String>> {
        for group in self.ctx.repos.paused_groups.all().await? {
            let all_marker = group == ALL_GROUPS_PAUSED;
            if matcher.is_match(&group) && (!all_marker || *matcher == GroupMatcher::Anything) {
                self.ctx.repos.paused_groups.delete(&group).await?;
            }
        }

        let mut groups = BTreeSet::new();
        for key in self.ctx.repos.triggers.keys(matcher).await? {
            self.resume_trigger_locked(&key, signals).await?;
            groups.insert(key.group);
        }
        Ok(groups.into_iter().collect())
    }

    #[instrument(skip_all, fields(job = %key))]
    pub async fn resume_job(&self, key: &JobKey) -> SchedulerResult<()> {
        in_trigger_lock!(self, |signals| {
            self.resume_job_locked(key, &mut signals).await
        })
    }

    async fn resume_job_locked(
        &self,
        key: &JobKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        for trigger in self.ctx.repos.triggers.find_by_job(key).await? {
            self.resume_trigger_locked(&trigger.key, signals).await?;
        }
        Ok(())
    }

    /// 恢复匹配分组中全部作业的触发器，返回涉及的作业分组名
    #[instrument(skip_all, fields(matcher = ?matcher))]
    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        in_trigger_lock!(self, |signals| {
            self.resume_jobs_locked(matcher, &mut signals).await
        })
    }

    async fn resume_jobs_locked(
        &self,
        matcher: &GroupMatcher,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<Vec<String>> {
        let mut groups = BTreeSet::new();
        for job_key in self.ctx.repos.jobs.keys(matcher).await? {
            self.resume_job_locked(&job_key, signals).await?;
            groups.insert(job_key.group);
        }
        Ok(groups.into_iter().collect())
    }

    /// 暂停全部触发器分组，并记录“所有分组已暂停”标记
    #[instrument(skip_all)]
    pub async fn pause_all(&self) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.pause_all_locked().await
        })
    }

    async fn pause_all_locked(&self) -> SchedulerResult<()> {
        for group in self.ctx.repos.triggers.group_names().await? {
            self.pause_trigger_group_locked(&GroupMatcher::Equals(group))
                .await?;
        }
        self.ctx.repos.paused_groups.insert(ALL_GROUPS_PAUSED).await?;
        info!("已暂停全部触发器分组");
        Ok(())
    }

    /// 恢复全部触发器分组并清除所有暂停记录
    #[instrument(skip_all)]
    pub async fn resume_all(&self) -> SchedulerResult<()> {
        in_trigger_lock!(self, |signals| {
            self.resume_all_locked(&mut signals).await
        })
    }

    async fn resume_all_locked(&self, signals: &mut PendingSignals) -> SchedulerResult<()> {
        for group in self.ctx.repos.triggers.group_names().await? {
            self.resume_trigger_group_locked(&GroupMatcher::Equals(group), signals)
                .await?;
        }
        self.ctx.repos.paused_groups.delete_all().await?;
        info!("已恢复全部触发器分组");
        Ok(())
    }

    /// 把 `Error` 状态的触发器恢复为 `Waiting`，所在分组暂停时恢复为 `Paused`
    #[instrument(skip_all, fields(trigger = %key))]
    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> SchedulerResult<()> {
        in_trigger_lock!(self, |signals| {
            self.reset_trigger_from_error_state_locked(key, &mut signals)
                .await
        })
    }

    async fn reset_trigger_from_error_state_locked(
        &self,
        key: &TriggerKey,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        let Some(state) = self.ctx.repos.triggers.state(key).await? else {
            return Ok(());
        };
        if state != TriggerState::Error {
            return Ok(());
        }
        let paused_groups = &self.ctx.repos.paused_groups;
        let new_state = if paused_groups.exists(&key.group).await?
            || paused_groups.exists(ALL_GROUPS_PAUSED).await?
        {
            TriggerState::Paused
        } else {
            TriggerState::Waiting
        };
        self.ctx
            .repos
            .triggers
            .update_state_from(key, new_state, &[TriggerState::Error])
            .await?;
        signals.scheduling_change(None);
        info!("触发器 {} 从 ERROR 恢复为 {}", key, new_state);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 触发
    // ---------------------------------------------------------------------

    /// 获取即将触发的触发器
    ///
    /// 候选为下次触发时间不晚于 `no_later_than + time_window` 的 `Waiting` 触发器，
    /// 按触发时间升序、优先级降序处理。禁止并发的作业每批最多获取一个触发器。
    #[instrument(skip_all, fields(max_count = max_count))]
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        in_trigger_lock!(self, {
            self.acquire_next_triggers_locked(no_later_than, max_count, time_window)
                .await
        })
    }

    async fn acquire_next_triggers_locked(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let repos = &self.ctx.repos;
        let mut acquired: Vec<Trigger> = Vec::new();
        let mut non_concurrent_jobs: HashSet<JobKey> = HashSet::new();
        let mut current_loop = 0;

        loop {
            current_loop += 1;
            let candidates = repos
                .triggers
                .find_to_acquire(
                    no_later_than + time_window,
                    self.ctx.misfire_time(),
                    max_count,
                )
                .await?;
            if candidates.is_empty() {
                return Ok(acquired);
            }

            let mut batch_end = no_later_than;
            for record in candidates {
                let key = record.key.clone();
                let mut trigger = TriggerFactory::from_record(record)?;
                let Some(next_fire_time) = trigger.next_fire_time else {
                    continue;
                };

                let Some(job) = repos.jobs.find(&trigger.job_key).await? else {
                    warn!("触发器 {} 关联的作业 {} 不存在，标记为 ERROR", key, trigger.job_key);
                    repos.triggers.update_state(&key, TriggerState::Error).await?;
                    continue;
                };
                if job.concurrent_execution_disallowed
                    && !non_concurrent_jobs.insert(job.key.clone())
                {
                    continue;
                }

                if next_fire_time > batch_end {
                    break;
                }

                let claimed = repos
                    .triggers
                    .update_state_from(&key, TriggerState::Acquired, &[TriggerState::Waiting])
                    .await?;
                if claimed == 0 {
                    debug!("触发器 {} 已被其他实例获取", key);
                    continue;
                }

                let entry_id = self.ctx.ids.next_fire_instance_id();
                repos
                    .fired_triggers
                    .insert(&FiredTriggerRecord {
                        entry_id: entry_id.clone(),
                        trigger_key: key.clone(),
                        job_key: job.key.clone(),
                        instance_id: self.ctx.instance_id.clone(),
                        fired_at: Utc::now(),
                        scheduled_at: Some(next_fire_time),
                        priority: trigger.priority,
                        state: FiredTriggerState::Acquired,
                        concurrent_execution_disallowed: job.concurrent_execution_disallowed,
                        requests_recovery: false,
                    })
                    .await?;
                trigger.fire_instance_id = Some(entry_id);

                if acquired.is_empty() {
                    batch_end = next_fire_time.max(Utc::now()) + time_window;
                }
                debug!("获取触发器 {}，计划触发时间 {}", key, next_fire_time);
                acquired.push(trigger);
                if acquired.len() >= max_count {
                    break;
                }
            }

            if !acquired.is_empty() || current_loop >= MAX_DO_LOOP_RETRY {
                break;
            }
        }

        counter!("jobstore_triggers_acquired_total").increment(acquired.len() as u64);
        Ok(acquired)
    }

    /// 放弃已获取但未触发的触发器
    #[instrument(skip_all, fields(trigger = %trigger.key))]
    pub async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        in_trigger_lock!(self, {
            self.release_acquired_trigger_locked(trigger).await
        })
    }

    async fn release_acquired_trigger_locked(&self, trigger: &Trigger) -> SchedulerResult<()> {
        self.ctx
            .repos
            .triggers
            .update_state_from(
                &trigger.key,
                TriggerState::Waiting,
                &[TriggerState::Acquired],
            )
            .await?;
        if let Some(entry_id) = &trigger.fire_instance_id {
            self.ctx.repos.fired_triggers.delete(entry_id).await?;
        }
        debug!("释放触发器 {}", trigger.key);
        Ok(())
    }

    /// 通知触发器即将执行
    ///
    /// 每个触发器独立处理，返回与输入一一对应的结果；
    /// 触发器已不是 `Acquired` 或日历缺失时结果为 `Ok(None)`。
    #[instrument(skip_all, fields(count = triggers.len()))]
    pub async fn triggers_fired(
        &self,
        triggers: &[Trigger],
    ) -> SchedulerResult<Vec<SchedulerResult<Option<TriggerFiredBundle>>>> {
        in_trigger_lock!(self, {
            let mut results = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                let result = self.trigger_fired_locked(trigger).await;
                if let Err(e) = &result {
                    warn!("触发器 {} 触发失败: {}", trigger.key, e);
                }
                results.push(result);
            }
            Ok(results)
        })
    }

    async fn trigger_fired_locked(
        &self,
        trigger: &Trigger,
    ) -> SchedulerResult<Option<TriggerFiredBundle>> {
        let repos = &self.ctx.repos;
        match repos.triggers.state(&trigger.key).await? {
            Some(TriggerState::Acquired) => {}
            _ => return Ok(None),
        }

        let Some(mut job) = repos.jobs.find(&trigger.job_key).await? else {
            repos
                .triggers
                .update_state(&trigger.key, TriggerState::Error)
                .await?;
            return Err(SchedulerError::job_not_found(trigger.job_key.to_string()));
        };

        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => match repos.calendars.find(name).await? {
                Some(calendar) => Some(calendar),
                None => return Ok(None),
            },
            None => None,
        };

        let now = Utc::now();
        let fired_record = FiredTriggerRecord {
            entry_id: trigger
                .fire_instance_id
                .clone()
                .unwrap_or_else(|| self.ctx.ids.next_fire_instance_id()),
            trigger_key: trigger.key.clone(),
            job_key: job.key.clone(),
            instance_id: self.ctx.instance_id.clone(),
            fired_at: now,
            scheduled_at: trigger.next_fire_time,
            priority: trigger.priority,
            state: FiredTriggerState::Executing,
            concurrent_execution_disallowed: job.concurrent_execution_disallowed,
            requests_recovery: job.requests_recovery,
        };
        if !repos.fired_triggers.update(&fired_record).await? {
            repos.fired_triggers.insert(&fired_record).await?;
        }

        let previous_fire_time = trigger.previous_fire_time;
        let mut fired = trigger.clone();
        fired.fire_instance_id = Some(fired_record.entry_id.clone());
        fired.triggered(calendar.as_ref());

        let (state, force_state) = if job.concurrent_execution_disallowed {
            repos
                .triggers
                .update_states_for_job_from(
                    &job.key,
                    TriggerState::Blocked,
                    &[TriggerState::Waiting, TriggerState::Acquired],
                )
                .await?;
            repos
                .triggers
                .update_states_for_job_from(
                    &job.key,
                    TriggerState::PausedBlocked,
                    &[TriggerState::Paused],
                )
                .await?;
            (TriggerState::Blocked, false)
        } else if fired.next_fire_time.is_none() {
            (TriggerState::Complete, true)
        } else {
            (TriggerState::Waiting, true)
        };

        self.ctx
            .store_trigger_internal(&fired, Some(&job), true, state, force_state, false)
            .await?;
        job.job_data.clear_dirty_flag();

        counter!("jobstore_triggers_fired_total").increment(1);
        debug!("触发器 {} 已触发，状态 {}", fired.key, state);
        Ok(Some(TriggerFiredBundle {
            job_is_recovering: fired.key.group == RECOVERING_JOBS_GROUP,
            scheduled_fire_time: fired.previous_fire_time,
            next_fire_time: fired.next_fire_time,
            previous_fire_time,
            fire_time: now,
            calendar,
            trigger: fired,
            job,
        }))
    }

    /// 作业执行完成，按指令更新触发器并解除同一作业其他触发器的阻塞
    #[instrument(skip_all, fields(trigger = %trigger.key, instruction = ?instruction))]
    pub async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        in_trigger_lock!(self, |signals| {
            self.triggered_job_complete_locked(trigger, job, instruction, &mut signals)
                .await
        })
    }

    async fn triggered_job_complete_locked(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
        signals: &mut PendingSignals,
    ) -> SchedulerResult<()> {
        let repos = &self.ctx.repos;
        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // 执行期间可能被重新调度，只有存储中也没有下次触发时间才删除
                    let stored = repos.triggers.find(&trigger.key).await?;
                    if stored.is_some_and(|record| record.next_fire_time.is_none()) {
                        self.ctx
                            .remove_trigger_internal(&trigger.key, signals)
                            .await?;
                    }
                } else {
                    self.ctx
                        .remove_trigger_internal(&trigger.key, signals)
                        .await?;
                    signals.scheduling_change(None);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                repos
                    .triggers
                    .update_state(&trigger.key, TriggerState::Complete)
                    .await?;
                signals.finalized(trigger);
                signals.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!("触发器 {} 被置为 ERROR 状态", trigger.key);
                repos
                    .triggers
                    .update_state(&trigger.key, TriggerState::Error)
                    .await?;
                signals.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                repos
                    .triggers
                    .update_states_for_job(&job.key, TriggerState::Complete)
                    .await?;
                signals.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!("作业 {} 的全部触发器被置为 ERROR 状态", job.key);
                repos
                    .triggers
                    .update_states_for_job(&job.key, TriggerState::Error)
                    .await?;
                signals.scheduling_change(None);
            }
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {}
        }

        if job.concurrent_execution_disallowed {
            // 没有下次触发时间的触发器解除阻塞后不会再被获取，直接完成
            for record in repos.triggers.find_by_job(&job.key).await? {
                if record.next_fire_time.is_none()
                    && matches!(
                        record.state,
                        TriggerState::Blocked | TriggerState::PausedBlocked
                    )
                {
                    repos
                        .triggers
                        .update_state(&record.key, TriggerState::Complete)
                        .await?;
                    signals.finalized(&TriggerFactory::from_record(record)?);
                }
            }
            repos
                .triggers
                .update_states_for_job_from(
                    &job.key,
                    TriggerState::Waiting,
                    &[TriggerState::Blocked],
                )
                .await?;
            repos
                .triggers
                .update_states_for_job_from(
                    &job.key,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )
                .await?;
            signals.scheduling_change(None);
        }

        if job.persist_job_data_after_execution && job.job_data.is_dirty() {
            repos.jobs.update_job_data(&job.key, &job.job_data).await?;
            debug!("回写作业 {} 的数据", job.key);
        }

        if let Some(entry_id) = &trigger.fire_instance_id {
            repos.fired_triggers.delete(entry_id).await?;
        }
        Ok(())
    }
}
