//! Test data builders for creating test entities
//!
//! Builders with sensible defaults: jobs are durable-less, concurrent jobs of
//! type `TestJob`, triggers repeat forever every second starting now.

use chrono::{DateTime, Utc};
use scheduler_domain::{
    Calendar, IntervalUnit, JobDataMap, JobDetail, JobKey, MisfireInstruction, Schedule,
    TimeOfDay, Trigger, TriggerKey, DEFAULT_GROUP, REPEAT_INDEFINITELY,
};
use std::time::Duration;

/// Builder for creating test JobDetail entities
pub struct JobDetailBuilder {
    job: JobDetail,
}

impl JobDetailBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            job: JobDetail::new(JobKey::new(name, DEFAULT_GROUP), "TestJob"),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.job.key.group = group.to_string();
        self
    }

    pub fn durable(mut self) -> Self {
        self.job.durable = true;
        self
    }

    pub fn non_concurrent(mut self) -> Self {
        self.job.concurrent_execution_disallowed = true;
        self
    }

    pub fn persist_job_data(mut self) -> Self {
        self.job.persist_job_data_after_execution = true;
        self
    }

    pub fn requests_recovery(mut self) -> Self {
        self.job.requests_recovery = true;
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.job.job_data.put(key, value);
        self.job.job_data.clear_dirty_flag();
        self
    }

    pub fn build(self) -> JobDetail {
        self.job
    }
}

/// Builder for creating test Trigger entities
pub struct TriggerBuilder {
    trigger: Trigger,
}

impl TriggerBuilder {
    pub fn new(name: &str, job_key: &JobKey) -> Self {
        Self {
            trigger: Trigger::new(
                TriggerKey::new(name, DEFAULT_GROUP),
                job_key.clone(),
                Schedule::simple(Duration::from_secs(1), REPEAT_INDEFINITELY),
            ),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.trigger.key.group = group.to_string();
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.trigger.schedule = schedule;
        self
    }

    pub fn repeat_every(self, interval: Duration, repeat_count: i32) -> Self {
        self.with_schedule(Schedule::simple(interval, repeat_count))
    }

    pub fn once(self) -> Self {
        self.with_schedule(Schedule::once())
    }

    /// 每天 09:00-17:00 之间每小时触发
    pub fn office_hours(self) -> Self {
        self.with_schedule(Schedule::daily_time_interval(
            TimeOfDay::new(9, 0, 0),
            TimeOfDay::new(17, 0, 0),
            1..=5,
            1,
            IntervalUnit::Hour,
        ))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.trigger.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.trigger.misfire_instruction = instruction;
        self
    }

    pub fn starting_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.trigger.start_time = start_time;
        self
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.trigger.end_time = Some(end_time);
        self
    }

    pub fn modified_by_calendar(mut self, calendar_name: &str) -> Self {
        self.trigger.calendar_name = Some(calendar_name.to_string());
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.trigger.job_data = job_data;
        self
    }

    /// 构建并按日历计算首次触发时间
    pub fn build_with_calendar(self, calendar: Option<&Calendar>) -> Trigger {
        let mut trigger = self.trigger;
        trigger.compute_first_fire_time(calendar);
        trigger
    }

    pub fn build(self) -> Trigger {
        self.build_with_calendar(None)
    }
}
