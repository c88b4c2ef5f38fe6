//! 运行时触发器
//!
//! 触发器携带公共字段（标识、优先级、起止时间、触发时间、错过触发策略）
//! 和一个按类型区分的 [`Schedule`]。下次触发时间的推进、日历跳过以及
//! 错过触发后的修正都在这里完成，作业存储只负责持久化结果。

mod record;
mod schedule;

pub use record::*;
pub use schedule::*;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::calendar::Calendar;
use crate::entities::JobDataMap;
use crate::value_objects::{JobKey, TriggerKey};

/// 默认优先级
pub const DEFAULT_PRIORITY: i32 = 5;

/// 跳过日历排除时间时的最大尝试次数
const MAX_CALENDAR_SKIPS: usize = 10_000;

/// 超过该年份不再计算触发时间
const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

/// 错过触发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfireInstruction {
    /// 忽略错过，按原计划立即补触发所有错过的时间点
    IgnoreMisfires,
    /// 根据调度类型选择合适的策略
    Smart,
    /// 立即触发一次
    FireNow,
    /// 放弃错过的触发，等待下一个计划时间
    DoNothing,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    RescheduleNextWithRemainingCount,
    RescheduleNextWithExistingCount,
}

impl MisfireInstruction {
    pub const ALL: [MisfireInstruction; 8] = [
        MisfireInstruction::IgnoreMisfires,
        MisfireInstruction::Smart,
        MisfireInstruction::FireNow,
        MisfireInstruction::DoNothing,
        MisfireInstruction::RescheduleNowWithExistingRepeatCount,
        MisfireInstruction::RescheduleNowWithRemainingRepeatCount,
        MisfireInstruction::RescheduleNextWithRemainingCount,
        MisfireInstruction::RescheduleNextWithExistingCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireInstruction::IgnoreMisfires => "IGNORE_MISFIRES",
            MisfireInstruction::Smart => "SMART",
            MisfireInstruction::FireNow => "FIRE_NOW",
            MisfireInstruction::DoNothing => "DO_NOTHING",
            MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                "RESCHEDULE_NOW_WITH_EXISTING_REPEAT_COUNT"
            }
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                "RESCHEDULE_NOW_WITH_REMAINING_REPEAT_COUNT"
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                "RESCHEDULE_NEXT_WITH_REMAINING_COUNT"
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                "RESCHEDULE_NEXT_WITH_EXISTING_COUNT"
            }
        }
    }

    /// 判断策略是否适用于指定调度类型
    pub fn is_valid_for(&self, schedule: &Schedule) -> bool {
        match self {
            MisfireInstruction::IgnoreMisfires
            | MisfireInstruction::Smart
            | MisfireInstruction::FireNow => true,
            MisfireInstruction::DoNothing => !matches!(schedule, Schedule::Simple(_)),
            _ => matches!(schedule, Schedule::Simple(_)),
        }
    }
}

impl fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MisfireInstruction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MisfireInstruction::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| format!("Invalid misfire instruction: {s}"))
    }
}

/// 触发器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub misfire_instruction: MisfireInstruction,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub job_data: JobDataMap,
    pub schedule: Schedule,
    /// 被获取后分配的触发实例ID
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::Smart,
            start_time: Utc::now(),
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            job_data: JobDataMap::new(),
            schedule,
            fire_instance_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn modified_by_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn starting_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.job_data = job_data;
        self
    }

    pub fn with_next_fire_time(mut self, next_fire_time: Option<DateTime<Utc>>) -> Self {
        self.next_fire_time = next_fire_time;
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.key.name.is_empty() || self.key.group.is_empty() {
            return Err(SchedulerError::invalid_schedule("触发器名称和分组不能为空"));
        }
        if self.job_key.name.is_empty() || self.job_key.group.is_empty() {
            return Err(SchedulerError::invalid_schedule("触发器必须关联一个作业"));
        }
        self.schedule.validate()?;
        if self.end_time.is_some_and(|end| end < self.start_time) {
            return Err(SchedulerError::invalid_schedule("结束时间不能早于开始时间"));
        }
        if !self.misfire_instruction.is_valid_for(&self.schedule) {
            return Err(SchedulerError::invalid_schedule(format!(
                "错过触发策略 {} 不适用于 {} 调度",
                self.misfire_instruction,
                self.schedule.kind_name()
            )));
        }
        Ok(())
    }

    /// 错过触发时是否按原计划触发
    pub fn ignores_misfires(&self) -> bool {
        self.misfire_instruction == MisfireInstruction::IgnoreMisfires
    }

    /// 严格晚于 `after`（默认为当前时间）的下一次计划触发时间，不考虑日历
    pub fn fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let after = after.unwrap_or_else(Utc::now);
        self.schedule
            .fire_time_after(self.start_time, self.end_time, after)
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// 计算首次触发时间并写入 `next_fire_time`
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let first = self.fire_time_after(Some(self.start_time - Duration::milliseconds(1)));
        self.next_fire_time = self.skip_excluded(first, calendar);
        self.next_fire_time
    }

    /// 记录一次触发，推进前后触发时间
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.schedule.record_triggered();
        self.previous_fire_time = self.next_fire_time;
        let next = self.fire_time_after(self.next_fire_time);
        self.next_fire_time = self.skip_excluded(next, calendar);
    }

    /// 根据错过触发策略修正下次触发时间
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        let mut instruction = self.misfire_instruction;
        if instruction == MisfireInstruction::IgnoreMisfires {
            return;
        }

        let simple_repeat = match &self.schedule {
            Schedule::Simple(simple) => Some(simple.repeat_count),
            _ => None,
        };

        if instruction == MisfireInstruction::Smart {
            instruction = match simple_repeat {
                None | Some(0) => MisfireInstruction::FireNow,
                Some(REPEAT_INDEFINITELY) => MisfireInstruction::RescheduleNextWithRemainingCount,
                Some(_) => MisfireInstruction::RescheduleNowWithExistingRepeatCount,
            };
        } else if instruction == MisfireInstruction::FireNow
            && simple_repeat.is_some_and(|count| count != 0)
        {
            instruction = MisfireInstruction::RescheduleNowWithRemainingRepeatCount;
        }

        match instruction {
            MisfireInstruction::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfireInstruction::DoNothing | MisfireInstruction::RescheduleNextWithExistingCount => {
                let next = self.fire_time_after(Some(now));
                self.next_fire_time = self.skip_excluded(next, calendar);
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let next = self.fire_time_after(Some(now));
                let next = self.skip_excluded(next, calendar);
                if let (Some(new_time), Some(old_time), Schedule::Simple(simple)) =
                    (next, self.next_fire_time, &mut self.schedule)
                {
                    let missed = simple.times_fired_between(old_time, new_time);
                    simple.times_triggered = simple.times_triggered.saturating_add(missed);
                }
                self.next_fire_time = next;
            }
            MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                if let Schedule::Simple(simple) = &mut self.schedule {
                    if simple.repeat_count != 0 && simple.repeat_count != REPEAT_INDEFINITELY {
                        simple.repeat_count = (simple.repeat_count - simple.times_triggered).max(0);
                        simple.times_triggered = 0;
                    }
                }
                self.reschedule_now(now);
            }
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                let old_time = self.next_fire_time;
                if let Schedule::Simple(simple) = &mut self.schedule {
                    if simple.repeat_count != 0 && simple.repeat_count != REPEAT_INDEFINITELY {
                        let missed = old_time
                            .map(|t| simple.times_fired_between(t, now))
                            .unwrap_or(0);
                        simple.repeat_count = (simple.repeat_count
                            - simple.times_triggered.saturating_add(missed))
                        .max(0);
                        simple.times_triggered = 0;
                    }
                }
                self.reschedule_now(now);
            }
            MisfireInstruction::IgnoreMisfires | MisfireInstruction::Smart => {}
        }
    }

    /// 关联的日历变化后重新计算下次触发时间
    ///
    /// 重新计算出的时间如果已经落后当前时间超过 `misfire_threshold`，继续向后推进。
    pub fn update_with_new_calendar(
        &mut self,
        calendar: Option<&Calendar>,
        misfire_threshold: Duration,
    ) {
        let after = self
            .previous_fire_time
            .unwrap_or(self.start_time - Duration::milliseconds(1));
        let mut next = self.fire_time_after(Some(after));
        let Some(calendar) = calendar else {
            self.next_fire_time = next;
            return;
        };
        let now = Utc::now();
        let mut attempts = 0;
        while let Some(time) = next {
            if calendar.is_time_included(time) && now - time < misfire_threshold {
                break;
            }
            attempts += 1;
            if attempts > MAX_CALENDAR_SKIPS || time.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                next = None;
                break;
            }
            next = self.fire_time_after(Some(time));
        }
        self.next_fire_time = next;
    }

    fn reschedule_now(&mut self, now: DateTime<Utc>) {
        if self.end_time.is_some_and(|end| end < now) {
            self.next_fire_time = None;
        } else {
            self.start_time = now;
            self.next_fire_time = Some(now);
        }
    }

    /// 跳过被日历排除的触发时间
    fn skip_excluded(
        &self,
        mut time: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let Some(calendar) = calendar else {
            return time;
        };
        let mut attempts = 0;
        while let Some(t) = time {
            if calendar.is_time_included(t) {
                return Some(t);
            }
            attempts += 1;
            if attempts > MAX_CALENDAR_SKIPS || t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            time = self.fire_time_after(Some(t));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn simple_trigger(repeat_count: i32, start: DateTime<Utc>) -> Trigger {
        Trigger::new(
            TriggerKey::new("t1", "g"),
            JobKey::new("j1", "g"),
            Schedule::simple(std::time::Duration::from_secs(60), repeat_count),
        )
        .starting_at(start)
    }

    #[test]
    fn test_triggered_advances_fire_times() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let mut trigger = simple_trigger(1, start);
        assert_eq!(trigger.compute_first_fire_time(None), Some(start));

        trigger.triggered(None);
        assert_eq!(trigger.previous_fire_time, Some(start));
        assert_eq!(trigger.next_fire_time, Some(at(2024, 1, 1, 0, 1, 0)));

        trigger.triggered(None);
        assert_eq!(trigger.next_fire_time, None);
        assert!(!trigger.may_fire_again());
    }

    #[test]
    fn test_calendar_skips_excluded_fire_times() {
        // 2024-01-06 周六
        let start = at(2024, 1, 6, 9, 0, 0);
        let mut trigger = Trigger::new(
            TriggerKey::new("daily", "g"),
            JobKey::new("j1", "g"),
            Schedule::calendar_interval(1, IntervalUnit::Day),
        )
        .starting_at(start);
        let weekdays_only = Calendar::weekly([6, 7]);
        assert_eq!(
            trigger.compute_first_fire_time(Some(&weekdays_only)),
            Some(at(2024, 1, 8, 9, 0, 0))
        );
    }

    #[test]
    fn test_smart_misfire_for_one_shot_fires_now() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let now = at(2024, 1, 1, 1, 0, 0);
        let mut trigger = simple_trigger(0, start);
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, now);
        assert_eq!(trigger.next_fire_time, Some(now));
    }

    #[test]
    fn test_smart_misfire_for_indefinite_simple_skips_to_next() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let now = at(2024, 1, 1, 0, 10, 30);
        let mut trigger = simple_trigger(REPEAT_INDEFINITELY, start);
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, now);
        assert_eq!(trigger.next_fire_time, Some(at(2024, 1, 1, 0, 11, 0)));
        match &trigger.schedule {
            Schedule::Simple(simple) => assert_eq!(simple.times_triggered, 11),
            other => panic!("unexpected schedule {other:?}"),
        }
    }

    #[test]
    fn test_smart_misfire_for_counted_simple_reschedules_now() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let now = at(2024, 1, 1, 0, 10, 30);
        let mut trigger = simple_trigger(5, start);
        trigger.compute_first_fire_time(None);
        trigger.triggered(None);
        trigger.update_after_misfire(None, now);
        assert_eq!(trigger.next_fire_time, Some(now));
        assert_eq!(trigger.start_time, now);
        match &trigger.schedule {
            Schedule::Simple(simple) => {
                assert_eq!(simple.repeat_count, 4);
                assert_eq!(simple.times_triggered, 0);
            }
            other => panic!("unexpected schedule {other:?}"),
        }
    }

    #[test]
    fn test_cron_misfire_do_nothing_waits_for_next_slot() {
        let mut trigger = Trigger::new(
            TriggerKey::new("cron", "g"),
            JobKey::new("j1", "g"),
            Schedule::cron("0 0 * * * *").unwrap(),
        )
        .starting_at(at(2024, 1, 1, 0, 0, 0))
        .with_misfire_instruction(MisfireInstruction::DoNothing);
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, at(2024, 1, 1, 5, 30, 0));
        assert_eq!(trigger.next_fire_time, Some(at(2024, 1, 1, 6, 0, 0)));

        let mut smart = trigger.clone().with_misfire_instruction(MisfireInstruction::Smart);
        smart.update_after_misfire(None, at(2024, 1, 1, 5, 30, 0));
        assert_eq!(smart.next_fire_time, Some(at(2024, 1, 1, 5, 30, 0)));
    }

    #[test]
    fn test_ignore_misfires_keeps_fire_time() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let mut trigger =
            simple_trigger(3, start).with_misfire_instruction(MisfireInstruction::IgnoreMisfires);
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, at(2024, 6, 1, 0, 0, 0));
        assert_eq!(trigger.next_fire_time, Some(start));
    }

    #[test]
    fn test_misfire_past_end_time_completes() {
        let start = at(2024, 1, 1, 0, 0, 0);
        let mut trigger = simple_trigger(5, start).ending_at(at(2024, 1, 1, 0, 5, 0));
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, at(2024, 1, 1, 1, 0, 0));
        assert_eq!(trigger.next_fire_time, None);
    }

    #[test]
    fn test_update_with_new_calendar() {
        let start = at(2024, 1, 1, 9, 0, 0);
        let mut trigger = Trigger::new(
            TriggerKey::new("daily", "g"),
            JobKey::new("j1", "g"),
            Schedule::calendar_interval(1, IntervalUnit::Day),
        )
        .starting_at(start);
        trigger.compute_first_fire_time(None);
        let holiday = Calendar::holiday([NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()]);
        trigger.update_with_new_calendar(Some(&holiday), Duration::days(100_000));
        assert_eq!(trigger.next_fire_time, Some(at(2024, 1, 2, 9, 0, 0)));
    }

    #[test]
    fn test_validate_rejects_mismatched_misfire_instruction() {
        let trigger = Trigger::new(
            TriggerKey::new("cron", "g"),
            JobKey::new("j1", "g"),
            Schedule::cron("0 0 * * * *").unwrap(),
        )
        .with_misfire_instruction(MisfireInstruction::RescheduleNextWithRemainingCount);
        assert!(trigger.validate().is_err());

        let trigger = simple_trigger(1, Utc::now()).ending_at(Utc::now() - Duration::days(1));
        assert!(trigger.validate().is_err());
    }

    #[test]
    fn test_misfire_instruction_str_round_trip() {
        for instruction in MisfireInstruction::ALL {
            assert_eq!(instruction.as_str().parse::<MisfireInstruction>().unwrap(), instruction);
        }
    }
}
