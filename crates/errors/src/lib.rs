use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 作业存储错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// 底层数据访问失败，保留原始错误
    #[error("持久化错误: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("对象已存在: {kind} '{key}'")]
    ObjectAlreadyExists { kind: &'static str, key: String },

    #[error("作业未找到: {key}")]
    JobNotFound { key: String },

    #[error("触发器未找到: {key}")]
    TriggerNotFound { key: String },

    #[error("日历未找到: {name}")]
    CalendarNotFound { name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度参数: {0}")]
    InvalidSchedule(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("不支持的操作: {0}")]
    NotSupported(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("获取集群锁 {lock} 被取消")]
    LockAcquisitionCancelled { lock: String },

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence {
            message: msg.into(),
            source: None,
        }
    }

    pub fn persistence_with_source<S, E>(msg: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Self::Persistence {
            message: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn already_exists<S: Into<String>>(kind: &'static str, key: S) -> Self {
        Self::ObjectAlreadyExists {
            kind,
            key: key.into(),
        }
    }

    pub fn job_not_found<S: Into<String>>(key: S) -> Self {
        Self::JobNotFound { key: key.into() }
    }

    pub fn trigger_not_found<S: Into<String>>(key: S) -> Self {
        Self::TriggerNotFound { key: key.into() }
    }

    pub fn calendar_not_found<S: Into<String>>(name: S) -> Self {
        Self::CalendarNotFound { name: name.into() }
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn invalid_schedule<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    /// 是否为数据访问层错误
    pub fn is_persistence(&self) -> bool {
        matches!(self, SchedulerError::Persistence { .. })
    }

    /// 将非持久化错误包装为持久化错误，附加操作上下文
    ///
    /// 业务性错误（已存在、未找到、不支持等）原样返回。
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        match self {
            SchedulerError::Persistence { message, source } => SchedulerError::Persistence {
                message: format!("{}: {message}", context.into()),
                source,
            },
            SchedulerError::Serialization(msg) => SchedulerError::Persistence {
                message: format!("{}: {msg}", context.into()),
                source: None,
            },
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Persistence { .. })
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::persistence_with_source("数据库访问失败", err)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
