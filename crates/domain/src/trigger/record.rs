//! 触发器持久化记录
//!
//! 每种调度类型对应一个带类型的记录，持久化为 (类型标签, JSON) 两列。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::entities::{JobDataMap, TriggerState};
use crate::value_objects::{JobKey, TriggerKey};

use super::MisfireInstruction;

pub const CRON_KIND: &str = "CRON";
pub const SIMPLE_KIND: &str = "SIMPLE";
pub const CALENDAR_INTERVAL_KIND: &str = "CAL_INT";
pub const DAILY_TIME_INTERVAL_KIND: &str = "DAILY_I";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTriggerRecord {
    pub cron_expression: String,
    pub time_zone_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTriggerRecord {
    pub repeat_count: i32,
    pub repeat_interval_ms: i64,
    pub times_triggered: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarIntervalTriggerRecord {
    pub repeat_interval: i32,
    /// 单位名称，如 `DAY`、`MONTH`
    pub repeat_interval_unit: String,
    pub times_triggered: i32,
    pub time_zone_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTimeIntervalTriggerRecord {
    /// `HH:MM:SS`
    pub start_time_of_day: String,
    pub end_time_of_day: String,
    /// 逗号分隔的ISO星期编号，如 `1,2,3,4,5`
    pub days_of_week: String,
    pub repeat_interval: i32,
    pub repeat_interval_unit: String,
    pub repeat_count: i32,
    pub times_triggered: i32,
    pub time_zone_id: String,
}

/// 调度类型相关的持久化数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleRecord {
    Cron(CronTriggerRecord),
    Simple(SimpleTriggerRecord),
    CalendarInterval(CalendarIntervalTriggerRecord),
    DailyTimeInterval(DailyTimeIntervalTriggerRecord),
}

impl ScheduleRecord {
    /// 持久化使用的类型标签
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ScheduleRecord::Cron(_) => CRON_KIND,
            ScheduleRecord::Simple(_) => SIMPLE_KIND,
            ScheduleRecord::CalendarInterval(_) => CALENDAR_INTERVAL_KIND,
            ScheduleRecord::DailyTimeInterval(_) => DAILY_TIME_INTERVAL_KIND,
        }
    }

    pub fn to_json(&self) -> SchedulerResult<String> {
        let json = match self {
            ScheduleRecord::Cron(r) => serde_json::to_string(r)?,
            ScheduleRecord::Simple(r) => serde_json::to_string(r)?,
            ScheduleRecord::CalendarInterval(r) => serde_json::to_string(r)?,
            ScheduleRecord::DailyTimeInterval(r) => serde_json::to_string(r)?,
        };
        Ok(json)
    }

    /// 根据类型标签解码持久化数据，未知标签返回 `NotSupported`
    pub fn decode(kind_tag: &str, json: &str) -> SchedulerResult<Self> {
        let record = match kind_tag {
            CRON_KIND => ScheduleRecord::Cron(serde_json::from_str(json)?),
            SIMPLE_KIND => ScheduleRecord::Simple(serde_json::from_str(json)?),
            CALENDAR_INTERVAL_KIND => ScheduleRecord::CalendarInterval(serde_json::from_str(json)?),
            DAILY_TIME_INTERVAL_KIND => {
                ScheduleRecord::DailyTimeInterval(serde_json::from_str(json)?)
            }
            other => {
                return Err(SchedulerError::not_supported(format!(
                    "未知的触发器类型标签: {other}"
                )))
            }
        };
        Ok(record)
    }
}

/// 持久化的触发器
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRecord {
    pub scheduler_name: String,
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub state: TriggerState,
    pub priority: i32,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub calendar_name: Option<String>,
    pub misfire_instruction: MisfireInstruction,
    pub job_data: JobDataMap,
    pub schedule: ScheduleRecord,
}
