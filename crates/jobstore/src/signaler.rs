//! 作业存储向调度引擎发出的通知
//!
//! 锁内产生的通知先收集到 [`PendingSignals`]，释放锁之后再统一投递，
//! 调度引擎的回调不会在持有集群锁时执行。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::{JobKey, Trigger};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 调度引擎回调接口
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey);

    /// 调度计划发生变化，`candidate_new_next_fire_time` 为 None 表示时间未知
    async fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);
}

/// 通过通道转发的通知事件
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    TriggerMisfired(Trigger),
    TriggerFinalized(Trigger),
    JobDeleted(JobKey),
    SchedulingChange(Option<DateTime<Utc>>),
}

/// 把通知转换为 [`SignalEvent`] 发送到 tokio 通道
#[derive(Debug, Clone)]
pub struct ChannelSignaler {
    sender: mpsc::UnboundedSender<SignalEvent>,
}

impl ChannelSignaler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: SignalEvent) {
        if self.sender.send(event).is_err() {
            debug!("通知接收端已关闭，丢弃事件");
        }
    }
}

#[async_trait]
impl SchedulerSignaler for ChannelSignaler {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.send(SignalEvent::TriggerMisfired(trigger.clone()));
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.send(SignalEvent::TriggerFinalized(trigger.clone()));
    }

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        self.send(SignalEvent::JobDeleted(job_key.clone()));
    }

    async fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        self.send(SignalEvent::SchedulingChange(candidate_new_next_fire_time));
    }
}

/// 只记录日志的通知器，用于没有调度引擎的独立节点
#[derive(Debug, Clone, Default)]
pub struct LoggingSignaler;

#[async_trait]
impl SchedulerSignaler for LoggingSignaler {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        warn!("触发器 {} 错过触发", trigger.key);
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        info!("触发器 {} 已完成，不会再触发", trigger.key);
    }

    async fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        info!("作业 {} 已被删除", job_key);
    }

    async fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        match candidate_new_next_fire_time {
            Some(time) => debug!("调度计划变化，最早触发时间 {}", time),
            None => debug!("调度计划变化"),
        }
    }
}

/// 锁内收集、锁外投递的通知
#[derive(Debug, Default)]
pub struct PendingSignals {
    events: Vec<SignalEvent>,
    scheduling_change: Option<Option<DateTime<Utc>>>,
}

impl PendingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn misfired(&mut self, trigger: &Trigger) {
        self.events.push(SignalEvent::TriggerMisfired(trigger.clone()));
    }

    pub fn finalized(&mut self, trigger: &Trigger) {
        self.events.push(SignalEvent::TriggerFinalized(trigger.clone()));
    }

    pub fn job_deleted(&mut self, job_key: &JobKey) {
        self.events.push(SignalEvent::JobDeleted(job_key.clone()));
    }

    /// 多次调度变化合并为一次，保留最早的候选时间，未知时间优先
    pub fn scheduling_change(&mut self, candidate: Option<DateTime<Utc>>) {
        let merged = match (self.scheduling_change.take(), candidate) {
            (None, candidate) => candidate,
            (Some(None), _) | (Some(Some(_)), None) => None,
            (Some(Some(current)), Some(candidate)) => Some(current.min(candidate)),
        };
        self.scheduling_change = Some(merged);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.scheduling_change.is_none()
    }

    pub async fn dispatch(self, signaler: Option<&Arc<dyn SchedulerSignaler>>) {
        let Some(signaler) = signaler else {
            return;
        };
        for event in self.events {
            match event {
                SignalEvent::TriggerMisfired(trigger) => {
                    signaler.notify_trigger_listeners_misfired(&trigger).await
                }
                SignalEvent::TriggerFinalized(trigger) => {
                    signaler.notify_scheduler_listeners_finalized(&trigger).await
                }
                SignalEvent::JobDeleted(job_key) => {
                    signaler.notify_scheduler_listeners_job_deleted(&job_key).await
                }
                SignalEvent::SchedulingChange(candidate) => {
                    signaler.signal_scheduling_change(candidate).await
                }
            }
        }
        if let Some(candidate) = self.scheduling_change {
            signaler.signal_scheduling_change(candidate).await;
        }
    }
}
