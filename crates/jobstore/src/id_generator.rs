use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use scheduler_domain::{TriggerKey, RECOVERING_JOBS_GROUP};

/// 已触发记录ID和恢复触发器名称的生成器
///
/// 计数器以创建时的毫秒时间戳为起点，同一实例重启后也不会与旧记录重复。
#[derive(Debug)]
pub struct FireInstanceIdGenerator {
    instance_id: String,
    counter: AtomicU64,
}

impl FireInstanceIdGenerator {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        Self {
            instance_id: instance_id.into(),
            counter: AtomicU64::new(seed),
        }
    }

    fn next_value(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// 新的触发实例ID
    pub fn next_fire_instance_id(&self) -> String {
        format!("{}{}", self.instance_id, self.next_value())
    }

    /// 新的恢复触发器标识 `recover_<实例ID>_<序号>`
    pub fn next_recovery_trigger_key(&self) -> TriggerKey {
        TriggerKey::new(
            format!("recover_{}_{}", self.instance_id, self.next_value()),
            RECOVERING_JOBS_GROUP,
        )
    }
}
