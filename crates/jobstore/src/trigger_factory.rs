//! 运行时触发器与持久化记录之间的转换
//!
//! 每种调度类型对应一个 [`ScheduleRecord`] 变体，转换是无损的。
//! 所有时间按 UTC 计算，持久化记录中的时区字段固定为 `UTC`。

use scheduler_domain::{
    CalendarIntervalSchedule, CalendarIntervalTriggerRecord, CronSchedule, CronTriggerRecord,
    DailyTimeIntervalSchedule, DailyTimeIntervalTriggerRecord, IntervalUnit, Schedule,
    ScheduleRecord, SimpleSchedule, SimpleTriggerRecord, TimeOfDay, Trigger, TriggerRecord,
    TriggerState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use std::collections::BTreeSet;

const UTC_ZONE: &str = "UTC";

pub struct TriggerFactory;

impl TriggerFactory {
    /// 转换为持久化记录
    pub fn to_record(trigger: &Trigger, state: TriggerState, instance_name: &str) -> TriggerRecord {
        TriggerRecord {
            scheduler_name: instance_name.to_string(),
            key: trigger.key.clone(),
            job_key: trigger.job_key.clone(),
            description: trigger.description.clone(),
            state,
            priority: trigger.priority,
            next_fire_time: trigger.next_fire_time,
            previous_fire_time: trigger.previous_fire_time,
            start_time: trigger.start_time,
            end_time: trigger.end_time,
            calendar_name: trigger.calendar_name.clone(),
            misfire_instruction: trigger.misfire_instruction,
            job_data: trigger.job_data.clone(),
            schedule: Self::schedule_to_record(&trigger.schedule),
        }
    }

    /// 从持久化记录恢复运行时触发器
    pub fn from_record(record: TriggerRecord) -> SchedulerResult<Trigger> {
        let schedule = Self::schedule_from_record(&record.schedule)?;
        Ok(Trigger {
            key: record.key,
            job_key: record.job_key,
            description: record.description,
            calendar_name: record.calendar_name,
            priority: record.priority,
            misfire_instruction: record.misfire_instruction,
            start_time: record.start_time,
            end_time: record.end_time,
            next_fire_time: record.next_fire_time,
            previous_fire_time: record.previous_fire_time,
            job_data: record.job_data,
            schedule,
            fire_instance_id: None,
        })
    }

    /// 按类型标签解码持久化的调度数据
    pub fn schedule_from_parts(kind_tag: &str, json: &str) -> SchedulerResult<Schedule> {
        let record = ScheduleRecord::decode(kind_tag, json)?;
        Self::schedule_from_record(&record)
    }

    pub fn schedule_to_record(schedule: &Schedule) -> ScheduleRecord {
        match schedule {
            Schedule::Cron(cron) => ScheduleRecord::Cron(CronTriggerRecord {
                cron_expression: cron.expression.clone(),
                time_zone_id: UTC_ZONE.to_string(),
            }),
            Schedule::Simple(simple) => ScheduleRecord::Simple(SimpleTriggerRecord {
                repeat_count: simple.repeat_count,
                repeat_interval_ms: simple.repeat_interval_ms,
                times_triggered: simple.times_triggered,
            }),
            Schedule::CalendarInterval(interval) => {
                ScheduleRecord::CalendarInterval(CalendarIntervalTriggerRecord {
                    repeat_interval: interval.repeat_interval,
                    repeat_interval_unit: interval.repeat_interval_unit.as_str().to_string(),
                    times_triggered: interval.times_triggered,
                    time_zone_id: UTC_ZONE.to_string(),
                })
            }
            Schedule::DailyTimeInterval(daily) => {
                ScheduleRecord::DailyTimeInterval(DailyTimeIntervalTriggerRecord {
                    start_time_of_day: daily.start_time_of_day.to_string(),
                    end_time_of_day: daily.end_time_of_day.to_string(),
                    days_of_week: daily
                        .days_of_week
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                    repeat_interval: daily.repeat_interval,
                    repeat_interval_unit: daily.repeat_interval_unit.as_str().to_string(),
                    repeat_count: daily.repeat_count,
                    times_triggered: daily.times_triggered,
                    time_zone_id: UTC_ZONE.to_string(),
                })
            }
        }
    }

    pub fn schedule_from_record(record: &ScheduleRecord) -> SchedulerResult<Schedule> {
        let schedule = match record {
            ScheduleRecord::Cron(cron) => {
                Self::ensure_utc(&cron.time_zone_id)?;
                Schedule::Cron(CronSchedule {
                    expression: cron.cron_expression.clone(),
                })
            }
            ScheduleRecord::Simple(simple) => Schedule::Simple(SimpleSchedule {
                repeat_count: simple.repeat_count,
                repeat_interval_ms: simple.repeat_interval_ms,
                times_triggered: simple.times_triggered,
            }),
            ScheduleRecord::CalendarInterval(interval) => {
                Self::ensure_utc(&interval.time_zone_id)?;
                Schedule::CalendarInterval(CalendarIntervalSchedule {
                    repeat_interval: interval.repeat_interval,
                    repeat_interval_unit: Self::parse_unit(&interval.repeat_interval_unit)?,
                    times_triggered: interval.times_triggered,
                })
            }
            ScheduleRecord::DailyTimeInterval(daily) => {
                Self::ensure_utc(&daily.time_zone_id)?;
                Schedule::DailyTimeInterval(DailyTimeIntervalSchedule {
                    start_time_of_day: Self::parse_time_of_day(&daily.start_time_of_day)?,
                    end_time_of_day: Self::parse_time_of_day(&daily.end_time_of_day)?,
                    days_of_week: Self::parse_days(&daily.days_of_week)?,
                    repeat_interval: daily.repeat_interval,
                    repeat_interval_unit: Self::parse_unit(&daily.repeat_interval_unit)?,
                    repeat_count: daily.repeat_count,
                    times_triggered: daily.times_triggered,
                })
            }
        };
        Ok(schedule)
    }

    fn ensure_utc(zone: &str) -> SchedulerResult<()> {
        if zone.is_empty() || zone.eq_ignore_ascii_case(UTC_ZONE) || zone == "Etc/UTC" {
            return Ok(());
        }
        Err(SchedulerError::not_supported(format!(
            "不支持的时区: {zone}，仅支持 UTC"
        )))
    }

    fn parse_unit(value: &str) -> SchedulerResult<IntervalUnit> {
        value
            .parse()
            .map_err(|e: String| SchedulerError::Serialization(e))
    }

    fn parse_time_of_day(value: &str) -> SchedulerResult<TimeOfDay> {
        value
            .parse()
            .map_err(|e: String| SchedulerError::Serialization(e))
    }

    fn parse_days(value: &str) -> SchedulerResult<BTreeSet<u32>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|day| !day.is_empty())
            .map(|day| {
                day.parse::<u32>()
                    .map_err(|e| SchedulerError::Serialization(format!("无效的星期 '{day}': {e}")))
            })
            .collect()
    }
}
