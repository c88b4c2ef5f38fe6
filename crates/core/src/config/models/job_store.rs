use serde::{Deserialize, Serialize};
use std::time::Duration;

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 实例ID取该值时根据主机名和当前时间自动生成
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// 作业存储配置
///
/// # 字段说明
///
/// - `instance_id`: 集群内唯一的实例ID，`AUTO` 表示自动生成
/// - `instance_name`: 调度器名称，同名实例组成一个集群并共享数据
/// - `max_misfires_to_handle_at_a_time`: 每轮错过触发处理的最大触发器数
/// - `misfire_threshold_ms`: 触发时间落后超过该值才视为错过触发
/// - `db_retry_interval_ms`: 错过触发处理失败后的重试间隔
/// - `retryable_action_error_log_threshold`: 连续失败多少次记录一次错误日志
/// - `thread_pool_size`: 调度引擎执行线程数，仅作参考
/// - `lock_retry_interval_ms`: 集群锁被占用时的重试间隔
/// - `lock_ttl_seconds`: 锁被持有超过该时长视为孤儿锁，`None` 表示不清理
/// - `cluster_checkin_interval_ms`: 集群成员签到间隔
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreConfig {
    pub instance_id: String,
    pub instance_name: String,
    pub max_misfires_to_handle_at_a_time: usize,
    pub misfire_threshold_ms: u64,
    pub db_retry_interval_ms: u64,
    pub retryable_action_error_log_threshold: u32,
    pub thread_pool_size: usize,
    pub lock_retry_interval_ms: u64,
    pub lock_ttl_seconds: Option<u64>,
    pub cluster_checkin_interval_ms: u64,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            instance_id: AUTO_INSTANCE_ID.to_string(),
            instance_name: "ClusteredScheduler".to_string(),
            max_misfires_to_handle_at_a_time: 20,
            misfire_threshold_ms: 60_000,
            db_retry_interval_ms: 15_000,
            retryable_action_error_log_threshold: 4,
            thread_pool_size: 10,
            lock_retry_interval_ms: 1_000,
            lock_ttl_seconds: Some(600),
            cluster_checkin_interval_ms: 7_500,
        }
    }
}

impl JobStoreConfig {
    pub fn with_instance(
        instance_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// 验证作业存储配置
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.instance_name.trim().is_empty() {
            return Err(SchedulerError::config_error("instance_name不能为空"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(SchedulerError::config_error("instance_id不能为空"));
        }
        if self.misfire_threshold_ms == 0 {
            return Err(SchedulerError::config_error("misfire_threshold_ms必须大于0"));
        }
        if self.max_misfires_to_handle_at_a_time == 0 {
            return Err(SchedulerError::config_error(
                "max_misfires_to_handle_at_a_time必须大于0",
            ));
        }
        if self.retryable_action_error_log_threshold == 0 {
            return Err(SchedulerError::config_error(
                "retryable_action_error_log_threshold必须大于0",
            ));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(SchedulerError::config_error("lock_retry_interval_ms必须大于0"));
        }
        if self.lock_ttl_seconds == Some(0) {
            return Err(SchedulerError::config_error("lock_ttl_seconds必须大于0"));
        }
        Ok(())
    }

    /// 解析实际使用的实例ID
    ///
    /// 配置为 `AUTO` 时生成 `<主机名><毫秒时间戳>`。
    pub fn resolve_instance_id(&self) -> SchedulerResult<String> {
        if self.instance_id != AUTO_INSTANCE_ID {
            return Ok(self.instance_id.clone());
        }
        let host = hostname::get()
            .map_err(|e| SchedulerError::config_error(format!("获取主机名失败: {e}")))?;
        Ok(format!(
            "{}{}",
            host.to_string_lossy(),
            chrono::Utc::now().timestamp_millis()
        ))
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn db_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_retry_interval_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl_seconds.map(Duration::from_secs)
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_checkin_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_job_store_config() {
        let config = JobStoreConfig::default();
        assert_eq!(config.max_misfires_to_handle_at_a_time, 20);
        assert_eq!(config.misfire_threshold(), Duration::from_secs(60));
        assert_eq!(config.db_retry_interval(), Duration::from_secs(15));
        assert_eq!(config.lock_ttl(), Some(Duration::from_secs(600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_misfire_threshold_rejected() {
        let config = JobStoreConfig {
            misfire_threshold_ms: 0,
            ..JobStoreConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn test_explicit_instance_id_is_kept() {
        let config = JobStoreConfig::with_instance("cluster", "node-1");
        assert_eq!(config.resolve_instance_id().unwrap(), "node-1");
    }

    #[test]
    fn test_auto_instance_id_is_generated() {
        let config = JobStoreConfig::default();
        let id = config.resolve_instance_id().unwrap();
        assert_ne!(id, AUTO_INSTANCE_ID);
        assert!(!id.is_empty());
    }
}
