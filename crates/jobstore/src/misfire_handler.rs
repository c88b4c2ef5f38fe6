//! 错过触发处理器
//!
//! 独立的后台任务，周期性地签到并修正错过触发的触发器。
//! 只有 [`MisfireHandler::shutdown`] 能让它停止，等待集群锁和两轮之间的
//! 休眠都会被立即打断。

use chrono::Utc;
use scheduler_domain::LockType;
use scheduler_errors::SchedulerResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{MisfireRecoveryOutcome, StoreContext};
use crate::signaler::PendingSignals;

/// 两轮处理之间的最短间隔
const MIN_DELAY: Duration = Duration::from_millis(50);

pub struct MisfireHandler {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MisfireHandler {
    /// 启动后台任务，作业存储关闭时任务也随之取消
    pub(crate) fn spawn(ctx: Arc<StoreContext>) -> Self {
        let cancel = ctx.shutdown.child_token();
        let handle = tokio::spawn(run(ctx, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// 通知后台任务退出并等待其结束
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("等待错过触发处理器退出失败: {}", e);
            }
        }
    }
}

async fn run(ctx: Arc<StoreContext>, cancel: CancellationToken) {
    info!("实例 {} 的错过触发处理器已启动", ctx.instance_id);
    let threshold = ctx.config.misfire_threshold();
    let log_every = ctx.config.retryable_action_error_log_threshold.max(1);
    let mut num_fails: u32 = 0;

    loop {
        let started = Instant::now();
        let outcome = match manage(&ctx, &cancel).await {
            Ok(outcome) => {
                num_fails = 0;
                outcome
            }
            Err(e) => {
                num_fails = num_fails.saturating_add(1);
                if num_fails % log_every == 0 {
                    error!("错过触发处理失败（连续 {} 次）: {}", num_fails, e);
                } else {
                    debug!("错过触发处理失败（连续 {} 次）: {}", num_fails, e);
                }
                MisfireRecoveryOutcome::default()
            }
        };
        if cancel.is_cancelled() {
            break;
        }

        let delay = if outcome.has_more {
            MIN_DELAY
        } else {
            let delay = threshold.saturating_sub(started.elapsed()).max(MIN_DELAY);
            if num_fails > 0 {
                delay.max(ctx.config.db_retry_interval())
            } else {
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("实例 {} 的错过触发处理器已停止", ctx.instance_id);
}

/// 一轮处理：签到，有错过触发时在锁内修正并通知调度计划变化
async fn manage(
    ctx: &StoreContext,
    cancel: &CancellationToken,
) -> SchedulerResult<MisfireRecoveryOutcome> {
    ctx.repos
        .instances
        .update_checkin(&ctx.instance_id, Utc::now())
        .await?;

    if ctx.repos.triggers.count_misfired(ctx.misfire_time()).await? == 0 {
        debug!("没有错过触发的触发器");
        return Ok(MisfireRecoveryOutcome::default());
    }

    let guard = ctx
        .lock_manager
        .acquire(LockType::TriggerAccess, cancel)
        .await?;
    let mut signals = PendingSignals::new();
    let result = ctx.recover_misfired_triggers(false, &mut signals).await;
    if let Ok(outcome) = &result {
        if outcome.processed > 0 {
            signals.scheduling_change(outcome.earliest_new_time);
        }
    }
    ctx.complete(guard, signals, result).await
}
