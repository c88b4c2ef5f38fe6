use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::calendar::Calendar;
use crate::trigger::Trigger;
use crate::value_objects::{JobKey, TriggerKey};

/// 作业数据映射
///
/// 任何修改都会置位脏标记，作业执行结束后据此决定是否回写数据。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap {
    entries: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    dirty: bool,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.entries.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.entries.iter()
    }

    /// 合并另一个映射，后者覆盖同名键
    pub fn merge(&mut self, other: &JobDataMap) {
        for (k, v) in other.iter() {
            self.entries.insert(k.clone(), v.clone());
        }
        if !other.is_empty() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
    }
}

// 脏标记不参与相等比较
impl PartialEq for JobDataMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for JobDataMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            dirty: false,
        }
    }
}

/// 作业定义
///
/// # 字段说明
///
/// - `job_type`: 作业类型引用，由调度引擎解析为具体执行逻辑
/// - `durable`: 持久作业在没有触发器时也不会被删除
/// - `concurrent_execution_disallowed`: 同一作业同一时刻最多执行一个实例
/// - `persist_job_data_after_execution`: 执行后回写被修改的作业数据
/// - `requests_recovery`: 实例崩溃后需要在启动恢复时重新执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub job_type: String,
    pub description: Option<String>,
    pub durable: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_job_data_after_execution: bool,
    pub requests_recovery: bool,
    pub job_data: JobDataMap,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            durable: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            requests_recovery: false,
            job_data: JobDataMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.concurrent_execution_disallowed = disallow;
        self
    }

    pub fn persist_job_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    pub fn requests_recovery(mut self, recovery: bool) -> Self {
        self.requests_recovery = recovery;
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.job_data = job_data;
        self
    }
}

/// 触发器持久化状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
    Deleted,
}

impl TriggerState {
    pub const ALL: [TriggerState; 9] = [
        TriggerState::Waiting,
        TriggerState::Acquired,
        TriggerState::Executing,
        TriggerState::Complete,
        TriggerState::Paused,
        TriggerState::Blocked,
        TriggerState::PausedBlocked,
        TriggerState::Error,
        TriggerState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Paused => "PAUSED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Error => "ERROR",
            TriggerState::Deleted => "DELETED",
        }
    }

    /// 暂停覆盖：Waiting/Acquired → Paused，Blocked → PausedBlocked
    pub fn paused(self) -> Option<TriggerState> {
        match self {
            TriggerState::Waiting | TriggerState::Acquired => Some(TriggerState::Paused),
            TriggerState::Blocked => Some(TriggerState::PausedBlocked),
            _ => None,
        }
    }

    /// 取消暂停覆盖：Paused → Waiting，PausedBlocked → Blocked
    pub fn resumed(self) -> Option<TriggerState> {
        match self {
            TriggerState::Paused => Some(TriggerState::Waiting),
            TriggerState::PausedBlocked => Some(TriggerState::Blocked),
            _ => None,
        }
    }

    /// 对外暴露的触发器状态
    pub fn status(self) -> TriggerStatus {
        match self {
            TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing => {
                TriggerStatus::Normal
            }
            TriggerState::Paused | TriggerState::PausedBlocked => TriggerStatus::Paused,
            TriggerState::Blocked => TriggerStatus::Blocked,
            TriggerState::Complete => TriggerStatus::Complete,
            TriggerState::Error => TriggerStatus::Error,
            TriggerState::Deleted => TriggerStatus::None,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid trigger state: {s}"))
    }
}

/// 调度引擎可见的触发器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStatus {
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

/// 已触发记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredTriggerState {
    Acquired,
    Executing,
}

impl FiredTriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredTriggerState::Acquired => "ACQUIRED",
            FiredTriggerState::Executing => "EXECUTING",
        }
    }
}

impl FromStr for FiredTriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACQUIRED" => Ok(FiredTriggerState::Acquired),
            "EXECUTING" => Ok(FiredTriggerState::Executing),
            _ => Err(format!("Invalid fired trigger state: {s}")),
        }
    }
}

/// 已触发记录
///
/// 表示某个触发器正在集群中的某个实例上被触发或执行。
/// 由获取触发器时创建，执行完成、释放或崩溃恢复时删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: String,
    pub fired_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub state: FiredTriggerState,
    pub concurrent_execution_disallowed: bool,
    pub requests_recovery: bool,
}

/// 调度实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerInstanceState {
    Started,
    Paused,
    Resumed,
}

impl SchedulerInstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerInstanceState::Started => "STARTED",
            SchedulerInstanceState::Paused => "PAUSED",
            SchedulerInstanceState::Resumed => "RESUMED",
        }
    }
}

impl FromStr for SchedulerInstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(SchedulerInstanceState::Started),
            "PAUSED" => Ok(SchedulerInstanceState::Paused),
            "RESUMED" => Ok(SchedulerInstanceState::Resumed),
            _ => Err(format!("Invalid scheduler instance state: {s}")),
        }
    }
}

/// 集群成员记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInstanceRecord {
    pub instance_name: String,
    pub instance_id: String,
    pub state: SchedulerInstanceState,
    pub last_checkin_time: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

/// 集群锁类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    TriggerAccess,
    StateAccess,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::TriggerAccess => "TRIGGER_ACCESS",
            LockType::StateAccess => "STATE_ACCESS",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIGGER_ACCESS" => Ok(LockType::TriggerAccess),
            "STATE_ACCESS" => Ok(LockType::StateAccess),
            _ => Err(format!("Invalid lock type: {s}")),
        }
    }
}

/// 集群锁记录，每个 (instance_name, lock_type) 最多一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub instance_name: String,
    pub lock_type: LockType,
    pub owner_instance_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// 作业执行完成后对触发器的处理指令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

/// 触发成功后交给调度引擎执行的数据包
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    pub job_is_recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}
