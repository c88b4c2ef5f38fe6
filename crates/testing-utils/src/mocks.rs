//! Mock implementations for all repository traits
//!
//! In-memory implementations backed by `Arc<Mutex<..>>`, so every clone of a
//! mock observes the same state. Two job stores built from clones of the same
//! [`MockRepositories`] behave like two cluster nodes sharing one database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{
    Calendar, CalendarRepository, FiredTriggerRecord, FiredTriggerRepository, GroupMatcher,
    JobDataMap, JobDetail, JobKey, JobRepository, LockRecord, LockRepository, LockType,
    MisfireInstruction, PausedTriggerGroupRepository, SchedulerInstanceRecord,
    SchedulerInstanceRepository, SchedulerInstanceState, StoreRepositories, TriggerKey,
    TriggerRecord, TriggerRepository, TriggerState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn duplicate(kind: &'static str, key: impl ToString) -> SchedulerError {
    SchedulerError::already_exists(kind, key.to_string())
}

/// Mock implementation of JobRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<BTreeMap<JobKey, JobDetail>>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_all_jobs(&self) -> Vec<JobDetail> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn insert(&self, job: &JobDetail) -> SchedulerResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.key) {
            return Err(duplicate("作业", &job.key));
        }
        jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job: &JobDetail) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.key) {
            Some(existing) => {
                *existing = job.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        Ok(self.jobs.lock().unwrap().get(key).cloned())
    }

    async fn exists(&self, key: &JobKey) -> SchedulerResult<bool> {
        Ok(self.jobs.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &JobKey) -> SchedulerResult<bool> {
        Ok(self.jobs.lock().unwrap().remove(key).is_some())
    }

    async fn count(&self) -> SchedulerResult<usize> {
        Ok(self.jobs.lock().unwrap().len())
    }

    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<JobKey>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .keys()
            .filter(|key| matcher.is_match(&key.group))
            .cloned()
            .collect())
    }

    async fn group_names(&self) -> SchedulerResult<Vec<String>> {
        let groups: BTreeSet<String> = self
            .jobs
            .lock()
            .unwrap()
            .keys()
            .map(|key| key.group.clone())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn update_job_data(&self, key: &JobKey, data: &JobDataMap) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(key) {
            Some(job) => {
                job.job_data = data.clone();
                job.job_data.clear_dirty_flag();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let count = jobs.len() as u64;
        jobs.clear();
        Ok(count)
    }
}

/// Mock implementation of TriggerRepository for testing
///
/// `set_failing(true)` makes every call fail with a persistence error;
/// `fail_delete_of(key)` makes only deleting that trigger fail.
#[derive(Debug, Clone, Default)]
pub struct MockTriggerRepository {
    triggers: Arc<Mutex<BTreeMap<TriggerKey, TriggerRecord>>>,
    failing: Arc<AtomicBool>,
    failing_deletes: Arc<Mutex<BTreeSet<TriggerKey>>>,
}

impl MockTriggerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, key: &TriggerKey) {
        self.failing_deletes.lock().unwrap().insert(key.clone());
    }

    pub fn get_all_triggers(&self) -> Vec<TriggerRecord> {
        self.triggers.lock().unwrap().values().cloned().collect()
    }

    fn check(&self) -> SchedulerResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::persistence("模拟的数据库故障"));
        }
        Ok(())
    }

    fn update_where<F>(&self, state: TriggerState, predicate: F) -> SchedulerResult<u64>
    where
        F: Fn(&TriggerRecord) -> bool,
    {
        self.check()?;
        let mut triggers = self.triggers.lock().unwrap();
        let mut changed = 0;
        for record in triggers.values_mut() {
            if predicate(record) {
                record.state = state;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn sorted_for_firing(mut records: Vec<TriggerRecord>) -> Vec<TriggerRecord> {
        records.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then(b.priority.cmp(&a.priority))
        });
        records
    }
}

#[async_trait]
impl TriggerRepository for MockTriggerRepository {
    async fn insert(&self, trigger: &TriggerRecord) -> SchedulerResult<()> {
        self.check()?;
        let mut triggers = self.triggers.lock().unwrap();
        if triggers.contains_key(&trigger.key) {
            return Err(duplicate("触发器", &trigger.key));
        }
        triggers.insert(trigger.key.clone(), trigger.clone());
        Ok(())
    }

    async fn update(&self, trigger: &TriggerRecord) -> SchedulerResult<bool> {
        self.check()?;
        let mut triggers = self.triggers.lock().unwrap();
        match triggers.get_mut(&trigger.key) {
            Some(existing) => {
                *existing = trigger.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerRecord>> {
        self.check()?;
        Ok(self.triggers.lock().unwrap().get(key).cloned())
    }

    async fn exists(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        self.check()?;
        Ok(self.triggers.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        self.check()?;
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(SchedulerError::persistence(format!("模拟的删除失败: {key}")));
        }
        Ok(self.triggers.lock().unwrap().remove(key).is_some())
    }

    async fn count(&self) -> SchedulerResult<usize> {
        self.check()?;
        Ok(self.triggers.lock().unwrap().len())
    }

    async fn keys(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<TriggerKey>> {
        self.check()?;
        Ok(self
            .triggers
            .lock()
            .unwrap()
            .keys()
            .filter(|key| matcher.is_match(&key.group))
            .cloned()
            .collect())
    }

    async fn group_names(&self) -> SchedulerResult<Vec<String>> {
        self.check()?;
        let groups: BTreeSet<String> = self
            .triggers
            .lock()
            .unwrap()
            .keys()
            .map(|key| key.group.clone())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<TriggerRecord>> {
        self.check()?;
        Ok(self
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|r| &r.job_key == job_key)
            .cloned()
            .collect())
    }

    async fn find_by_calendar(&self, calendar_name: &str) -> SchedulerResult<Vec<TriggerRecord>> {
        self.check()?;
        Ok(self
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.calendar_name.as_deref() == Some(calendar_name))
            .cloned()
            .collect())
    }

    async fn state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        self.check()?;
        Ok(self.triggers.lock().unwrap().get(key).map(|r| r.state))
    }

    async fn update_state(&self, key: &TriggerKey, state: TriggerState) -> SchedulerResult<u64> {
        self.update_where(state, |r| &r.key == key)
    }

    async fn update_state_from(
        &self,
        key: &TriggerKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        self.update_where(state, |r| &r.key == key && expected.contains(&r.state))
    }

    async fn update_states_for_job(
        &self,
        job_key: &JobKey,
        state: TriggerState,
    ) -> SchedulerResult<u64> {
        self.update_where(state, |r| &r.job_key == job_key)
    }

    async fn update_states_for_job_from(
        &self,
        job_key: &JobKey,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        self.update_where(state, |r| {
            &r.job_key == job_key && expected.contains(&r.state)
        })
    }

    async fn update_states_in_group_from(
        &self,
        matcher: &GroupMatcher,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        self.update_where(state, |r| {
            matcher.is_match(&r.key.group) && expected.contains(&r.state)
        })
    }

    async fn update_states_from(
        &self,
        state: TriggerState,
        expected: &[TriggerState],
    ) -> SchedulerResult<u64> {
        self.update_where(state, |r| expected.contains(&r.state))
    }

    async fn find_keys_in_states(
        &self,
        states: &[TriggerState],
    ) -> SchedulerResult<Vec<TriggerKey>> {
        self.check()?;
        Ok(self
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|r| states.contains(&r.state))
            .map(|r| r.key.clone())
            .collect())
    }

    async fn find_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        max_count: usize,
    ) -> SchedulerResult<Vec<TriggerRecord>> {
        self.check()?;
        let candidates = self
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == TriggerState::Waiting)
            .filter(|r| {
                r.next_fire_time.is_some_and(|next| {
                    next <= no_later_than
                        && (r.misfire_instruction == MisfireInstruction::IgnoreMisfires
                            || next >= no_earlier_than)
                })
            })
            .cloned()
            .collect();
        let mut sorted = Self::sorted_for_firing(candidates);
        sorted.truncate(max_count);
        Ok(sorted)
    }

    async fn find_misfired(
        &self,
        older_than: DateTime<Utc>,
        max_count: Option<usize>,
    ) -> SchedulerResult<Vec<TriggerRecord>> {
        self.check()?;
        let misfired = self
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.state == TriggerState::Waiting
                    && r.misfire_instruction != MisfireInstruction::IgnoreMisfires
                    && r.next_fire_time.is_some_and(|next| next < older_than)
            })
            .cloned()
            .collect();
        let mut sorted = Self::sorted_for_firing(misfired);
        if let Some(max_count) = max_count {
            sorted.truncate(max_count);
        }
        Ok(sorted)
    }

    async fn count_misfired(&self, older_than: DateTime<Utc>) -> SchedulerResult<usize> {
        Ok(self.find_misfired(older_than, None).await?.len())
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        self.check()?;
        let mut triggers = self.triggers.lock().unwrap();
        let count = triggers.len() as u64;
        triggers.clear();
        Ok(count)
    }
}

/// Mock implementation of FiredTriggerRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockFiredTriggerRepository {
    records: Arc<Mutex<BTreeMap<String, FiredTriggerRecord>>>,
}

impl MockFiredTriggerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_all_records(&self) -> Vec<FiredTriggerRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    fn find_where<F>(&self, predicate: F) -> Vec<FiredTriggerRecord>
    where
        F: Fn(&FiredTriggerRecord) -> bool,
    {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| predicate(*r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.fired_at);
        records
    }
}

#[async_trait]
impl FiredTriggerRepository for MockFiredTriggerRepository {
    async fn insert(&self, record: &FiredTriggerRecord) -> SchedulerResult<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.entry_id) {
            return Err(duplicate("已触发记录", &record.entry_id));
        }
        records.insert(record.entry_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &FiredTriggerRecord) -> SchedulerResult<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&record.entry_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_instance(&self, instance_id: &str) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        Ok(self.find_where(|r| r.instance_id == instance_id))
    }

    async fn find_by_trigger(&self, key: &TriggerKey) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        Ok(self.find_where(|r| &r.trigger_key == key))
    }

    async fn find_by_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        Ok(self.find_where(|r| &r.job_key == job_key))
    }

    async fn delete(&self, entry_id: &str) -> SchedulerResult<bool> {
        Ok(self.records.lock().unwrap().remove(entry_id).is_some())
    }

    async fn delete_by_instance(&self, instance_id: &str) -> SchedulerResult<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.instance_id != instance_id);
        Ok((before - records.len()) as u64)
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let mut records = self.records.lock().unwrap();
        let count = records.len() as u64;
        records.clear();
        Ok(count)
    }
}

/// Mock implementation of CalendarRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockCalendarRepository {
    calendars: Arc<Mutex<BTreeMap<String, Calendar>>>,
}

impl MockCalendarRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CalendarRepository for MockCalendarRepository {
    async fn insert(&self, name: &str, calendar: &Calendar) -> SchedulerResult<()> {
        let mut calendars = self.calendars.lock().unwrap();
        if calendars.contains_key(name) {
            return Err(duplicate("日历", name));
        }
        calendars.insert(name.to_string(), calendar.clone());
        Ok(())
    }

    async fn update(&self, name: &str, calendar: &Calendar) -> SchedulerResult<bool> {
        let mut calendars = self.calendars.lock().unwrap();
        match calendars.get_mut(name) {
            Some(existing) => {
                *existing = calendar.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        Ok(self.calendars.lock().unwrap().get(name).cloned())
    }

    async fn exists(&self, name: &str) -> SchedulerResult<bool> {
        Ok(self.calendars.lock().unwrap().contains_key(name))
    }

    async fn delete(&self, name: &str) -> SchedulerResult<bool> {
        Ok(self.calendars.lock().unwrap().remove(name).is_some())
    }

    async fn count(&self) -> SchedulerResult<usize> {
        Ok(self.calendars.lock().unwrap().len())
    }

    async fn names(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.calendars.lock().unwrap().keys().cloned().collect())
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let mut calendars = self.calendars.lock().unwrap();
        let count = calendars.len() as u64;
        calendars.clear();
        Ok(count)
    }
}

/// Mock implementation of PausedTriggerGroupRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockPausedGroupRepository {
    groups: Arc<Mutex<BTreeSet<String>>>,
}

impl MockPausedGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PausedTriggerGroupRepository for MockPausedGroupRepository {
    async fn insert(&self, group: &str) -> SchedulerResult<()> {
        self.groups.lock().unwrap().insert(group.to_string());
        Ok(())
    }

    async fn delete(&self, group: &str) -> SchedulerResult<bool> {
        Ok(self.groups.lock().unwrap().remove(group))
    }

    async fn exists(&self, group: &str) -> SchedulerResult<bool> {
        Ok(self.groups.lock().unwrap().contains(group))
    }

    async fn all(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.groups.lock().unwrap().iter().cloned().collect())
    }

    async fn delete_all(&self) -> SchedulerResult<u64> {
        let mut groups = self.groups.lock().unwrap();
        let count = groups.len() as u64;
        groups.clear();
        Ok(count)
    }
}

/// Mock implementation of SchedulerInstanceRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockInstanceRepository {
    instances: Arc<Mutex<BTreeMap<String, SchedulerInstanceRecord>>>,
}

impl MockInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerInstanceRepository for MockInstanceRepository {
    async fn upsert(&self, record: &SchedulerInstanceRecord) -> SchedulerResult<()> {
        self.instances
            .lock()
            .unwrap()
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn update_state(
        &self,
        instance_id: &str,
        state: SchedulerInstanceState,
    ) -> SchedulerResult<bool> {
        let mut instances = self.instances.lock().unwrap();
        Ok(instances
            .get_mut(instance_id)
            .map(|record| record.state = state)
            .is_some())
    }

    async fn update_checkin(
        &self,
        instance_id: &str,
        checkin_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut instances = self.instances.lock().unwrap();
        Ok(instances
            .get_mut(instance_id)
            .map(|record| record.last_checkin_time = checkin_time)
            .is_some())
    }

    async fn delete(&self, instance_id: &str) -> SchedulerResult<bool> {
        Ok(self.instances.lock().unwrap().remove(instance_id).is_some())
    }

    async fn find_all(&self) -> SchedulerResult<Vec<SchedulerInstanceRecord>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }
}

/// Mock implementation of LockRepository for testing
///
/// `set_delete_failing(true)` makes releasing a lock fail while claiming
/// still works.
#[derive(Debug, Clone, Default)]
pub struct MockLockRepository {
    locks: Arc<Mutex<BTreeMap<&'static str, LockRecord>>>,
    delete_failing: Arc<AtomicBool>,
}

impl MockLockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delete_failing(&self, failing: bool) {
        self.delete_failing.store(failing, Ordering::SeqCst);
    }

    pub fn holder(&self, lock_type: LockType) -> Option<String> {
        self.locks
            .lock()
            .unwrap()
            .get(lock_type.as_str())
            .map(|lock| lock.owner_instance_id.clone())
    }
}

#[async_trait]
impl LockRepository for MockLockRepository {
    async fn try_insert(&self, lock: &LockRecord) -> SchedulerResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(lock.lock_type.as_str()) {
            return Ok(false);
        }
        locks.insert(lock.lock_type.as_str(), lock.clone());
        Ok(true)
    }

    async fn delete(&self, lock_type: LockType, owner_instance_id: &str) -> SchedulerResult<bool> {
        if self.delete_failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::persistence("模拟的数据库故障"));
        }
        let mut locks = self.locks.lock().unwrap();
        let owned = locks
            .get(lock_type.as_str())
            .is_some_and(|lock| lock.owner_instance_id == owner_instance_id);
        if owned {
            locks.remove(lock_type.as_str());
        }
        Ok(owned)
    }

    async fn find(&self, lock_type: LockType) -> SchedulerResult<Option<LockRecord>> {
        Ok(self.locks.lock().unwrap().get(lock_type.as_str()).cloned())
    }

    async fn delete_stale(
        &self,
        lock_type: LockType,
        acquired_before: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        let stale = locks
            .get(lock_type.as_str())
            .is_some_and(|lock| lock.acquired_at < acquired_before);
        if stale {
            locks.remove(lock_type.as_str());
        }
        Ok(stale)
    }
}

/// All mock repositories, with direct access to the concrete mocks
#[derive(Debug, Clone, Default)]
pub struct MockRepositories {
    pub jobs: MockJobRepository,
    pub triggers: MockTriggerRepository,
    pub fired_triggers: MockFiredTriggerRepository,
    pub calendars: MockCalendarRepository,
    pub paused_groups: MockPausedGroupRepository,
    pub instances: MockInstanceRepository,
    pub locks: MockLockRepository,
}

impl MockRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// 转换为作业存储使用的仓储集合，状态与本对象共享
    pub fn store_repositories(&self) -> StoreRepositories {
        StoreRepositories {
            jobs: Arc::new(self.jobs.clone()),
            triggers: Arc::new(self.triggers.clone()),
            fired_triggers: Arc::new(self.fired_triggers.clone()),
            calendars: Arc::new(self.calendars.clone()),
            paused_groups: Arc::new(self.paused_groups.clone()),
            instances: Arc::new(self.instances.clone()),
            locks: Arc::new(self.locks.clone()),
        }
    }
}
