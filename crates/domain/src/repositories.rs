//! 领域仓储抽象
//!
//! 定义作业存储的数据访问接口，遵循依赖倒置原则。
//! 所有仓储实例在创建时绑定一个调度器名称（集群名），只读写该名称下的数据。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use scheduler_errors::SchedulerResult;

use crate::calendar::Calendar;
use crate::entities::{
    FiredTriggerRecord, JobDataMap, JobDetail, LockRecord, LockType, SchedulerInstanceRecord,
    SchedulerInstanceState, TriggerState,
};
use crate::trigger::TriggerRecord;
use crate::value_objects::{GroupMatcher, JobKey, TriggerKey};

/// 作业仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &JobDetail) -> SchedulerResult<()>;
    async fn update(&self, job: &JobDetail) -> SchedulerResult<bool>;
    async fn find(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>>;
    async fn exists(&self, key: &JobKey) -> SchedulerResult<bool>;
    async fn delete(&self, key: &JobKey) -> SchedulerResult<bool>;
    async fn count(&self) -> SchedulerResult<usize>;
    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<JobKey>>;
    async fn group_names(&self) -> SchedulerResult<Vec<String>>;
    async fn update_job_data(&self, key: &JobKey, data: &JobDataMap) -> SchedulerResult<bool>;
    async fn delete_all(&self) -> SchedulerResult<u64>;
}

/// 触发器仓储抽象
///
/// 带 `_from` 后缀的方法是条件更新：只有当前状态在 `expected` 中的行会被修改，
/// 返回受影响的行数。获取触发器依赖这一语义防止重复触发。
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    async fn insert(&self, trigger: &TriggerRecord) -> SchedulerResult<()>;
    async fn update(&self, trigger: &TriggerRecord) -> SchedulerResult<bool>;
    async fn find(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerRecord>>;
    async fn exists(&self, key: &TriggerKey) -> SchedulerResult<bool>;
    async fn delete(&self, key: &TriggerKey) -> SchedulerResult<bool>;
    async fn count(&self) -> SchedulerResult<usize>;
    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<TriggerKey>>;
    async fn group_names(&self) -> SchedulerResult<Vec<String>>;
    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<TriggerRecord>>;
    async fn find_by_calendar(&self, calendar_name: &str) -> SchedulerResult<Vec<TriggerRecord>>;
    async fn state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>>;

    async fn update_state(&self, key: &TriggerKey, state: TriggerState) -> SchedulerResult<u64>;
    async fn update_state_from(
        &self,
        key: &TriggerKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64>;
    async fn update_states_for_job(
        &self,
        job_key: &JobKey,
        state: TriggerState,
    ) -> SchedulerResult<u64>;
    async fn update_states_for_job_from(
        &self,
        job_key: &JobKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64>;
    async fn update_states_in_group_from(
        &self,
        matcher: &GroupMatcher,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64>;
    async fn update_states_from(
        &self,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64>;
    async fn find_keys_in_states(&self, states: &[TriggerState])
        -> SchedulerResult<Vec<TriggerKey>>;

    /// 查询待获取的 `Waiting` 触发器，按下次触发时间升序、优先级降序排列
    ///
    /// `no_earlier_than` 之前的触发器视为已错过，除非其策略为忽略错过触发。
    async fn find_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> SchedulerResult<Vec<TriggerRecord>>;

    /// 查询下次触发时间早于 `older_than` 的 `Waiting` 触发器（忽略错过触发的除外）
    async fn find_misfired(
        &self,
        older_than: DateTime<Utc>,
        max_count: Option<usize>,
    ) -> SchedulerResult<Vec<TriggerRecord>>;
    async fn count_misfired(&self, older_than: DateTime<Utc>) -> SchedulerResult<usize>;
    async fn delete_all(&self) -> SchedulerResult<u64>;
}

/// 已触发记录仓储抽象
#[async_trait]
pub trait FiredTriggerRepository: Send + Sync {
    async fn insert(&self, record: &FiredTriggerRecord) -> SchedulerResult<()>;
    async fn update(&self, record: &FiredTriggerRecord) -> SchedulerResult<bool>;
    async fn find_by_instance(&self, instance_id: &str)
        -> SchedulerResult<Vec<FiredTriggerRecord>>;
    async fn find_by_trigger(&self, key: &TriggerKey) -> SchedulerResult<Vec<FiredTriggerRecord>>;
    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<FiredTriggerRecord>>;
    async fn delete(&self, entry_id: &str) -> SchedulerResult<bool>;
    async fn delete_by_instance(&self, instance_id: &str) -> SchedulerResult<u64>;
    async fn delete_all(&self) -> SchedulerResult<u64>;
}

/// 日历仓储抽象
#[async_trait]
pub trait CalendarRepository: Send + Sync {
    async fn insert(&self, name: &str, calendar: &Calendar) -> SchedulerResult<()>;
    async fn update(&self, name: &str, calendar: &Calendar) -> SchedulerResult<bool>;
    async fn find(&self, name: &str) -> SchedulerResult<Option<Calendar>>;
    async fn exists(&self, name: &str) -> SchedulerResult<bool>;
    async fn delete(&self, name: &str) -> SchedulerResult<bool>;
    async fn count(&self) -> SchedulerResult<usize>;
    async fn names(&self) -> SchedulerResult<Vec<String>>;
    async fn delete_all(&self) -> SchedulerResult<u64>;
}

/// 暂停分组仓储抽象
#[async_trait]
pub trait PausedTriggerGroupRepository: Send + Sync {
    /// 重复插入同一分组不报错
    async fn insert(&self, group: &str) -> SchedulerResult<()>;
    async fn delete(&self, group: &str) -> SchedulerResult<bool>;
    async fn exists(&self, group: &str) -> SchedulerResult<bool>;
    async fn all(&self) -> SchedulerResult<Vec<String>>;
    async fn delete_all(&self) -> SchedulerResult<u64>;
}

/// 集群成员仓储抽象
#[async_trait]
pub trait SchedulerInstanceRepository: Send + Sync {
    async fn upsert(&self, record: &SchedulerInstanceRecord) -> SchedulerResult<()>;
    async fn update_state(
        &self,
        instance_id: &str,
        state: SchedulerInstanceState,
    ) -> SchedulerResult<bool>;
    async fn update_checkin(
        &self,
        instance_id: &str,
        checkin_time: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    async fn delete(&self, instance_id: &str) -> SchedulerResult<bool>;
    async fn find_all(&self) -> SchedulerResult<Vec<SchedulerInstanceRecord>>;
}

/// 集群锁仓储抽象
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// 插入锁记录，已存在同类型的锁时返回 false
    async fn try_insert(&self, lock: &LockRecord) -> SchedulerResult<bool>;
    /// 删除指定持有者的锁
    async fn delete(&self, lock_type: LockType, owner_instance_id: &str) -> SchedulerResult<bool>;
    async fn find(&self, lock_type: LockType) -> SchedulerResult<Option<LockRecord>>;
    /// 删除获取时间早于 `acquired_before` 的锁
    async fn delete_stale(
        &self,
        lock_type: LockType,
        acquired_before: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
}

/// 作业存储使用的全部仓储
#[derive(Clone)]
pub struct StoreRepositories {
    pub jobs: Arc<dyn JobRepository>,
    pub triggers: Arc<dyn TriggerRepository>,
    pub fired_triggers: Arc<dyn FiredTriggerRepository>,
    pub calendars: Arc<dyn CalendarRepository>,
    pub paused_groups: Arc<dyn PausedTriggerGroupRepository>,
    pub instances: Arc<dyn SchedulerInstanceRepository>,
    pub locks: Arc<dyn LockRepository>,
}
