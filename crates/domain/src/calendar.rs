//! 排除日历
//!
//! 日历定义一组“不允许触发”的时间段，触发器计算下次触发时间时会跳过
//! 被日历排除的时间点。日历可以链式叠加一个基础日历，两者的排除规则取并集。
//!
//! 持久化时整体序列化为 JSON 数据块，只保证可以无损往返。

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::trigger::TimeOfDay;

/// 查找下一个包含时间点时最多跳跃的次数
const MAX_INCLUDED_TIME_PROBES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub description: Option<String>,
    pub base: Option<Box<Calendar>>,
    pub exclusion: CalendarExclusion,
}

/// 日历排除规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarExclusion {
    /// 排除指定日期（整天）
    Holiday { dates: BTreeSet<NaiveDate> },
    /// 排除一周中的指定天，ISO编号 1=周一 … 7=周日
    Weekly { excluded_days: BTreeSet<u32> },
    /// 排除每天的一个时间段；`invert` 为 true 时只包含该时间段
    Daily {
        range_start: TimeOfDay,
        range_end: TimeOfDay,
        invert: bool,
    },
    /// 排除 CRON 表达式命中的秒
    Cron { expression: String },
    /// 不排除任何时间，仅用于承载基础日历
    Nothing,
}

impl Calendar {
    pub fn new(exclusion: CalendarExclusion) -> Self {
        Self {
            description: None,
            base: None,
            exclusion,
        }
    }

    pub fn holiday<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Self {
        Self::new(CalendarExclusion::Holiday {
            dates: dates.into_iter().collect(),
        })
    }

    pub fn weekly<I: IntoIterator<Item = u32>>(excluded_days: I) -> Self {
        Self::new(CalendarExclusion::Weekly {
            excluded_days: excluded_days.into_iter().collect(),
        })
    }

    pub fn daily(range_start: TimeOfDay, range_end: TimeOfDay) -> Self {
        Self::new(CalendarExclusion::Daily {
            range_start,
            range_end,
            invert: false,
        })
    }

    pub fn cron(expression: impl Into<String>) -> SchedulerResult<Self> {
        let expression = expression.into();
        parse_cron(&expression)?;
        Ok(Self::new(CalendarExclusion::Cron { expression }))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_base(mut self, base: Calendar) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    /// 校验日历参数
    pub fn validate(&self) -> SchedulerResult<()> {
        match &self.exclusion {
            CalendarExclusion::Weekly { excluded_days } => {
                if excluded_days.iter().any(|d| !(1..=7).contains(d)) {
                    return Err(SchedulerError::invalid_schedule("星期编号必须在1到7之间"));
                }
                if excluded_days.len() == 7 {
                    return Err(SchedulerError::invalid_schedule("不能排除一周中的所有天"));
                }
            }
            CalendarExclusion::Daily {
                range_start,
                range_end,
                ..
            } => {
                range_start.validate()?;
                range_end.validate()?;
                if range_start >= range_end {
                    return Err(SchedulerError::invalid_schedule(
                        "日排除区间的开始时间必须早于结束时间",
                    ));
                }
            }
            CalendarExclusion::Cron { expression } => {
                parse_cron(expression)?;
            }
            CalendarExclusion::Holiday { .. } | CalendarExclusion::Nothing => {}
        }
        match &self.base {
            Some(base) => base.validate(),
            None => Ok(()),
        }
    }

    /// 判断时间点是否被日历包含（未被排除）
    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        if let Some(base) = &self.base {
            if !base.is_time_included(time) {
                return false;
            }
        }
        !self.excludes(time)
    }

    /// 返回严格晚于 `time` 的下一个被包含的时间点
    pub fn next_included_time(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = time + Duration::milliseconds(1);
        for _ in 0..MAX_INCLUDED_TIME_PROBES {
            if self.is_time_included(candidate) {
                return Some(candidate);
            }
            candidate = self.skip_excluded(candidate);
        }
        None
    }

    fn excludes(&self, time: DateTime<Utc>) -> bool {
        match &self.exclusion {
            CalendarExclusion::Holiday { dates } => dates.contains(&time.date_naive()),
            CalendarExclusion::Weekly { excluded_days } => {
                excluded_days.contains(&time.weekday().number_from_monday())
            }
            CalendarExclusion::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let t = time.time();
                let in_range = t >= range_start.to_naive_time() && t <= range_end.to_naive_time();
                in_range != *invert
            }
            CalendarExclusion::Cron { expression } => match parse_cron(expression) {
                Ok(schedule) => {
                    let second = time.with_nanosecond(0).unwrap_or(time);
                    schedule
                        .after(&(second - Duration::seconds(1)))
                        .next()
                        .is_some_and(|hit| hit == second)
                }
                Err(_) => false,
            },
            CalendarExclusion::Nothing => false,
        }
    }

    /// 从一个被排除的时间点跳到下一个可能被包含的候选点
    fn skip_excluded(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(base) = &self.base {
            if !base.is_time_included(time) {
                return base.skip_excluded(time);
            }
        }
        match &self.exclusion {
            CalendarExclusion::Holiday { .. } | CalendarExclusion::Weekly { .. } => {
                start_of_next_day(time)
            }
            CalendarExclusion::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let date = time.date_naive();
                if *invert {
                    let start = Utc.from_utc_datetime(&date.and_time(range_start.to_naive_time()));
                    if time < start {
                        start
                    } else {
                        Utc.from_utc_datetime(
                            &(date + Duration::days(1)).and_time(range_start.to_naive_time()),
                        )
                    }
                } else {
                    Utc.from_utc_datetime(&date.and_time(range_end.to_naive_time()))
                        + Duration::seconds(1)
                }
            }
            CalendarExclusion::Cron { .. } => {
                time.with_nanosecond(0).unwrap_or(time) + Duration::seconds(1)
            }
            CalendarExclusion::Nothing => time + Duration::milliseconds(1),
        }
    }
}

fn start_of_next_day(time: DateTime<Utc>) -> DateTime<Utc> {
    let next = time.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&next.and_time(NaiveTime::MIN))
}

fn parse_cron(expression: &str) -> SchedulerResult<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
        expr: expression.to_string(),
        message: e.to_string(),
    })
}
