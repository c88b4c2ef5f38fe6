//! 基于共享存储的集群锁
//!
//! 插入锁记录即为加锁，删除即为解锁。同一进程内的竞争先经过本地互斥锁，
//! 只有跨进程竞争才会进入按 `lock_retry_interval` 的轮询等待。

use chrono::Utc;
use metrics::counter;
use scheduler_domain::{LockRecord, LockRepository, LockType};
use scheduler_errors::{SchedulerError, SchedulerResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct LockManager {
    locks: Arc<dyn LockRepository>,
    instance_name: String,
    instance_id: String,
    retry_interval: Duration,
    ttl: Option<Duration>,
    trigger_access: Arc<Mutex<()>>,
    state_access: Arc<Mutex<()>>,
}

impl LockManager {
    pub fn new(
        locks: Arc<dyn LockRepository>,
        instance_name: impl Into<String>,
        instance_id: impl Into<String>,
        retry_interval: Duration,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            locks,
            instance_name: instance_name.into(),
            instance_id: instance_id.into(),
            retry_interval,
            ttl,
            trigger_access: Arc::new(Mutex::new(())),
            state_access: Arc::new(Mutex::new(())),
        }
    }

    fn local(&self, lock_type: LockType) -> Arc<Mutex<()>> {
        match lock_type {
            LockType::TriggerAccess => self.trigger_access.clone(),
            LockType::StateAccess => self.state_access.clone(),
        }
    }

    fn cancelled(lock_type: LockType) -> SchedulerError {
        SchedulerError::LockAcquisitionCancelled {
            lock: lock_type.as_str().to_string(),
        }
    }

    /// 获取集群锁，锁被占用时按重试间隔等待，直到成功或被取消
    pub async fn acquire(
        &self,
        lock_type: LockType,
        cancel: &CancellationToken,
    ) -> SchedulerResult<LockGuard> {
        let local = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Self::cancelled(lock_type)),
            guard = self.local(lock_type).lock_owned() => guard,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(Self::cancelled(lock_type));
            }

            let record = LockRecord {
                instance_name: self.instance_name.clone(),
                lock_type,
                owner_instance_id: self.instance_id.clone(),
                acquired_at: Utc::now(),
            };
            if self.locks.try_insert(&record).await? {
                debug!("实例 {} 获取集群锁 {}", self.instance_id, lock_type);
                return Ok(LockGuard {
                    locks: self.locks.clone(),
                    lock_type,
                    owner: self.instance_id.clone(),
                    released: false,
                    local: Some(local),
                });
            }

            if self.break_orphaned(lock_type).await? {
                continue;
            }

            counter!("jobstore_lock_wait_retries_total", "lock" => lock_type.as_str())
                .increment(1);
            debug!(
                "集群锁 {} 被占用，{}ms 后重试",
                lock_type,
                self.retry_interval.as_millis()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Self::cancelled(lock_type)),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// 清理孤儿锁，返回是否清理成功
    ///
    /// 本地互斥锁在手时，登记在本实例名下的锁只能是上次运行遗留的；
    /// 其他实例的锁超过 TTL 才会被清理。
    async fn break_orphaned(&self, lock_type: LockType) -> SchedulerResult<bool> {
        if let Some(existing) = self.locks.find(lock_type).await? {
            if existing.owner_instance_id == self.instance_id
                && self.locks.delete(lock_type, &self.instance_id).await?
            {
                warn!("清理本实例遗留的集群锁 {}", lock_type);
                return Ok(true);
            }
        }

        let Some(ttl) = self.ttl else {
            return Ok(false);
        };
        let Some(acquired_before) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(false);
        };
        if self.locks.delete_stale(lock_type, acquired_before).await? {
            warn!(
                "集群锁 {} 持有时间超过 {}s，视为孤儿锁并清理",
                lock_type,
                ttl.as_secs()
            );
            return Ok(true);
        }
        Ok(false)
    }
}

/// 已持有的集群锁
///
/// 应调用 [`LockGuard::release`] 释放；未释放就被丢弃时在运行时上异步删除锁记录。
pub struct LockGuard {
    locks: Arc<dyn LockRepository>,
    lock_type: LockType,
    owner: String,
    released: bool,
    local: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_type", &self.lock_type)
            .field("owner", &self.owner)
            .finish()
    }
}

impl LockGuard {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub async fn release(mut self) -> SchedulerResult<()> {
        self.released = true;
        let deleted = self
            .locks
            .delete(self.lock_type, &self.owner)
            .await
            .map_err(|e| e.with_context(format!("释放集群锁 {} 失败", self.lock_type)))?;
        if deleted {
            debug!("实例 {} 释放集群锁 {}", self.owner, self.lock_type);
        } else {
            warn!("集群锁 {} 已不由实例 {} 持有", self.lock_type, self.owner);
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let local = self.local.take();
        let locks = self.locks.clone();
        let lock_type = self.lock_type;
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = locks.delete(lock_type, &owner).await {
                        warn!("异步释放集群锁 {} 失败: {}", lock_type, e);
                    }
                    drop(local);
                });
            }
            Err(_) => warn!("没有可用的运行时，集群锁 {} 未能释放", lock_type),
        }
    }
}
