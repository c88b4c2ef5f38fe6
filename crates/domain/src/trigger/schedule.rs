//! 四种调度类型的触发时间计算
//!
//! - `Cron`: CRON 表达式（含秒字段），按 UTC 计算
//! - `Simple`: 固定间隔重复，可指定重复次数
//! - `CalendarInterval`: 按日历单位（秒至年）间隔重复，月/年按自然月计算
//! - `DailyTimeInterval`: 在每天的时间窗口内按间隔重复，可限定星期

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 无限重复
pub const REPEAT_INDEFINITELY: i32 = -1;

/// 计算每日时间窗口触发时间时向后搜索的最大天数
const MAX_DAILY_SEARCH_DAYS: i64 = 366 * 2;

/// 重复间隔上限（约100年）
pub const MAX_REPEAT_INTERVAL_MS: i64 = 100 * 366 * 86_400_000;

const DAY_MS: i64 = 86_400_000;

/// `base` 加上 `millis` 毫秒，任何一步溢出都视为没有下一次触发
fn offset_millis(base: DateTime<Utc>, millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis
        .and_then(Duration::try_milliseconds)
        .and_then(|delta| base.checked_add_signed(delta))
}

/// 日内时间点
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32, second: u32) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.hour > 23 || self.minute > 59 || self.second > 59 {
            return Err(SchedulerError::invalid_schedule(format!(
                "无效的日内时间: {self}"
            )));
        }
        Ok(())
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second).unwrap_or(NaiveTime::MIN)
    }
}

/// 解析 `HH:MM:SS` 格式
impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(':')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Invalid time of day '{s}': {e}"))?;
        match parts.as_slice() {
            [hour, minute, second] => Ok(TimeOfDay::new(*hour, *minute, *second)),
            _ => Err(format!("Invalid time of day '{s}': expected HH:MM:SS")),
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

/// 间隔单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub const ALL: [IntervalUnit; 7] = [
        IntervalUnit::Second,
        IntervalUnit::Minute,
        IntervalUnit::Hour,
        IntervalUnit::Day,
        IntervalUnit::Week,
        IntervalUnit::Month,
        IntervalUnit::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Second => "SECOND",
            IntervalUnit::Minute => "MINUTE",
            IntervalUnit::Hour => "HOUR",
            IntervalUnit::Day => "DAY",
            IntervalUnit::Week => "WEEK",
            IntervalUnit::Month => "MONTH",
            IntervalUnit::Year => "YEAR",
        }
    }

    /// 固定长度单位的毫秒数，月和年返回 None
    fn fixed_millis(&self) -> Option<i64> {
        match self {
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntervalUnit::ALL
            .iter()
            .copied()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| format!("Invalid interval unit: {s}"))
    }
}

/// CRON 调度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: String,
}

impl CronSchedule {
    fn parse(&self) -> SchedulerResult<cron::Schedule> {
        cron::Schedule::from_str(&self.expression).map_err(|e| SchedulerError::InvalidCron {
            expr: self.expression.clone(),
            message: e.to_string(),
        })
    }

    fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.parse() {
            Ok(schedule) => schedule.after(&after).next(),
            Err(e) => {
                tracing::warn!("CRON表达式解析失败，无法计算触发时间: {}", e);
                None
            }
        }
    }
}

/// 固定间隔调度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub repeat_count: i32,
    pub repeat_interval_ms: i64,
    pub times_triggered: i32,
}

impl SimpleSchedule {
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_count != REPEAT_INDEFINITELY && self.times_triggered > self.repeat_count {
            return None;
        }
        if self.repeat_count == 0 && after >= start {
            return None;
        }
        if end.is_some_and(|e| e <= after) {
            return None;
        }
        if after < start {
            return Some(start);
        }
        let interval = self.repeat_interval_ms.max(1);
        let num_fired = (after - start).num_milliseconds() / interval + 1;
        if self.repeat_count != REPEAT_INDEFINITELY && num_fired > i64::from(self.repeat_count) {
            return None;
        }
        let next = offset_millis(start, num_fired.checked_mul(interval))?;
        if end.is_some_and(|e| e <= next) {
            return None;
        }
        Some(next)
    }

    /// 计算 (start, end] 区间内按间隔会触发的次数
    pub fn times_fired_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i32 {
        if self.repeat_interval_ms <= 0 || end <= start {
            return 0;
        }
        let n = (end - start).num_milliseconds() / self.repeat_interval_ms;
        i32::try_from(n).unwrap_or(i32::MAX)
    }
}

/// 日历间隔调度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarIntervalSchedule {
    pub repeat_interval: i32,
    pub repeat_interval_unit: IntervalUnit,
    pub times_triggered: i32,
}

impl CalendarIntervalSchedule {
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if end.is_some_and(|e| e <= after) {
            return None;
        }
        let next = if after < start {
            start
        } else {
            let interval = i64::from(self.repeat_interval.max(1));
            match self.repeat_interval_unit.fixed_millis() {
                Some(unit_ms) => {
                    let step = interval.checked_mul(unit_ms)?;
                    let k = (after - start).num_milliseconds() / step + 1;
                    offset_millis(start, k.checked_mul(step))?
                }
                None => {
                    let months_per_step = if self.repeat_interval_unit == IntervalUnit::Year {
                        interval.checked_mul(12)?
                    } else {
                        interval
                    };
                    let elapsed_months = i64::from(after.year() - start.year()) * 12
                        + i64::from(after.month()) - i64::from(start.month());
                    let mut k = (elapsed_months / months_per_step - 1).max(0);
                    loop {
                        let months = u32::try_from(k.checked_mul(months_per_step)?).ok()?;
                        let candidate = start.checked_add_months(Months::new(months))?;
                        if candidate > after {
                            break candidate;
                        }
                        k += 1;
                    }
                }
            }
        };
        if end.is_some_and(|e| e < next) {
            return None;
        }
        Some(next)
    }
}

/// 每日时间窗口调度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTimeIntervalSchedule {
    pub start_time_of_day: TimeOfDay,
    pub end_time_of_day: TimeOfDay,
    /// ISO编号 1=周一 … 7=周日
    pub days_of_week: BTreeSet<u32>,
    pub repeat_interval: i32,
    pub repeat_interval_unit: IntervalUnit,
    pub repeat_count: i32,
    pub times_triggered: i32,
}

impl DailyTimeIntervalSchedule {
    fn step_millis(&self) -> Option<i64> {
        let unit_ms = self.repeat_interval_unit.fixed_millis().unwrap_or(1_000);
        i64::from(self.repeat_interval.max(1)).checked_mul(unit_ms)
    }

    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_count != REPEAT_INDEFINITELY && self.times_triggered > self.repeat_count {
            return None;
        }
        // 首次触发不早于开始时间
        let after = if after < start {
            start - Duration::milliseconds(1)
        } else {
            after
        };
        let step = self.step_millis()?;
        let first_day = after.date_naive();

        for offset in 0..MAX_DAILY_SEARCH_DAYS {
            let date = first_day + Duration::days(offset);
            if !self
                .days_of_week
                .contains(&date.weekday().number_from_monday())
            {
                continue;
            }
            let window_start =
                Utc.from_utc_datetime(&date.and_time(self.start_time_of_day.to_naive_time()));
            let window_end =
                Utc.from_utc_datetime(&date.and_time(self.end_time_of_day.to_naive_time()));

            let candidate = if after >= window_start {
                let k = (after - window_start).num_milliseconds() / step + 1;
                offset_millis(window_start, k.checked_mul(step))?
            } else {
                window_start
            };

            if candidate <= window_end {
                if end.is_some_and(|e| e < candidate) {
                    return None;
                }
                return Some(candidate);
            }
        }
        None
    }
}

/// 触发器调度类型（四种类型的标签联合）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    Cron(CronSchedule),
    Simple(SimpleSchedule),
    CalendarInterval(CalendarIntervalSchedule),
    DailyTimeInterval(DailyTimeIntervalSchedule),
}

impl Schedule {
    /// 创建 CRON 调度，表达式包含秒字段
    pub fn cron(expression: impl Into<String>) -> SchedulerResult<Self> {
        let schedule = CronSchedule {
            expression: expression.into(),
        };
        schedule.parse()?;
        Ok(Schedule::Cron(schedule))
    }

    /// 创建固定间隔调度，`repeat_count` 为 -1 表示无限重复
    pub fn simple(repeat_interval: std::time::Duration, repeat_count: i32) -> Self {
        Schedule::Simple(SimpleSchedule {
            repeat_count,
            repeat_interval_ms: i64::try_from(repeat_interval.as_millis()).unwrap_or(i64::MAX),
            times_triggered: 0,
        })
    }

    /// 只触发一次
    pub fn once() -> Self {
        Self::simple(std::time::Duration::ZERO, 0)
    }

    pub fn calendar_interval(repeat_interval: i32, unit: IntervalUnit) -> Self {
        Schedule::CalendarInterval(CalendarIntervalSchedule {
            repeat_interval,
            repeat_interval_unit: unit,
            times_triggered: 0,
        })
    }

    pub fn daily_time_interval(
        start_time_of_day: TimeOfDay,
        end_time_of_day: TimeOfDay,
        days_of_week: impl IntoIterator<Item = u32>,
        repeat_interval: i32,
        unit: IntervalUnit,
    ) -> Self {
        Schedule::DailyTimeInterval(DailyTimeIntervalSchedule {
            start_time_of_day,
            end_time_of_day,
            days_of_week: days_of_week.into_iter().collect(),
            repeat_interval,
            repeat_interval_unit: unit,
            repeat_count: REPEAT_INDEFINITELY,
            times_triggered: 0,
        })
    }

    /// 调度类型名称
    pub fn kind_name(&self) -> &'static str {
        match self {
            Schedule::Cron(_) => "cron",
            Schedule::Simple(_) => "simple",
            Schedule::CalendarInterval(_) => "calendar_interval",
            Schedule::DailyTimeInterval(_) => "daily_time_interval",
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        match self {
            Schedule::Cron(cron) => cron.parse().map(|_| ()),
            Schedule::Simple(simple) => {
                if simple.repeat_count < REPEAT_INDEFINITELY {
                    return Err(SchedulerError::invalid_schedule("重复次数必须 >= -1"));
                }
                if simple.repeat_count != 0 && simple.repeat_interval_ms < 1 {
                    return Err(SchedulerError::invalid_schedule(
                        "重复触发的间隔必须大于0毫秒",
                    ));
                }
                if simple.repeat_interval_ms > MAX_REPEAT_INTERVAL_MS {
                    return Err(SchedulerError::invalid_schedule("重复间隔超出允许范围"));
                }
                Ok(())
            }
            Schedule::CalendarInterval(cal) => {
                if cal.repeat_interval < 1 {
                    return Err(SchedulerError::invalid_schedule("重复间隔必须 >= 1"));
                }
                // 月按31天、年按366天估算
                let unit_ms = match cal.repeat_interval_unit {
                    IntervalUnit::Month => 31 * DAY_MS,
                    IntervalUnit::Year => 366 * DAY_MS,
                    unit => unit.fixed_millis().unwrap_or(DAY_MS),
                };
                if i64::from(cal.repeat_interval)
                    .checked_mul(unit_ms)
                    .map_or(true, |ms| ms > MAX_REPEAT_INTERVAL_MS)
                {
                    return Err(SchedulerError::invalid_schedule("重复间隔超出允许范围"));
                }
                Ok(())
            }
            Schedule::DailyTimeInterval(daily) => {
                daily.start_time_of_day.validate()?;
                daily.end_time_of_day.validate()?;
                if daily.repeat_interval < 1 {
                    return Err(SchedulerError::invalid_schedule("重复间隔必须 >= 1"));
                }
                if daily.step_millis().map_or(true, |step| step > DAY_MS) {
                    return Err(SchedulerError::invalid_schedule(
                        "每日时间窗口调度的间隔不能超过一天",
                    ));
                }
                if !matches!(
                    daily.repeat_interval_unit,
                    IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour
                ) {
                    return Err(SchedulerError::invalid_schedule(
                        "每日时间窗口调度的间隔单位只能是秒、分钟或小时",
                    ));
                }
                if daily.start_time_of_day > daily.end_time_of_day {
                    return Err(SchedulerError::invalid_schedule(
                        "每日开始时间不能晚于结束时间",
                    ));
                }
                if daily.days_of_week.is_empty()
                    || daily.days_of_week.iter().any(|d| !(1..=7).contains(d))
                {
                    return Err(SchedulerError::invalid_schedule(
                        "星期集合不能为空且编号必须在1到7之间",
                    ));
                }
                if daily.repeat_count < REPEAT_INDEFINITELY {
                    return Err(SchedulerError::invalid_schedule("重复次数必须 >= -1"));
                }
                Ok(())
            }
        }
    }

    /// 计算严格晚于 `after` 的下一次触发时间，不考虑日历
    pub fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(cron) => {
                // CRON 的 after 迭代是开区间，回退一毫秒保证开始时间本身可以命中
                let from = if after < start {
                    start - Duration::milliseconds(1)
                } else {
                    after
                };
                let mut next = cron.fire_time_after(from)?;
                if next < start {
                    next = cron.fire_time_after(start)?;
                }
                if end.is_some_and(|e| e < next) {
                    return None;
                }
                Some(next)
            }
            Schedule::Simple(simple) => simple.fire_time_after(start, end, after),
            Schedule::CalendarInterval(cal) => cal.fire_time_after(start, end, after),
            Schedule::DailyTimeInterval(daily) => daily.fire_time_after(start, end, after),
        }
    }

    /// 记录一次触发
    pub(crate) fn record_triggered(&mut self) {
        match self {
            Schedule::Cron(_) => {}
            Schedule::Simple(s) => s.times_triggered = s.times_triggered.saturating_add(1),
            Schedule::CalendarInterval(c) => c.times_triggered = c.times_triggered.saturating_add(1),
            Schedule::DailyTimeInterval(d) => d.times_triggered = d.times_triggered.saturating_add(1),
        }
    }
}
