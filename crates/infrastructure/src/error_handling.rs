//! 仓储操作的错误上下文
//!
//! 将 sqlx 错误转换为带有操作类型和实体描述的 `SchedulerError`，
//! 唯一约束冲突转换为 `ObjectAlreadyExists`。

use scheduler_errors::SchedulerError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::debug;

/// Operation context for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    BatchUpdate,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "读取"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
            RepositoryOperation::BatchUpdate => write!(f, "批量更新"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// 仓储操作上下文
#[derive(Debug, Clone)]
pub struct StoreOperationContext {
    pub operation: RepositoryOperation,
    pub entity: &'static str,
    pub key: Option<String>,
}

impl StoreOperationContext {
    pub fn new(operation: RepositoryOperation, entity: &'static str) -> Self {
        Self {
            operation,
            entity,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl fmt::Display) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn entity_description(&self) -> String {
        match &self.key {
            Some(key) => format!("{} '{}'", self.entity, key),
            None => self.entity.to_string(),
        }
    }
}

/// Enhanced error helpers for repository operations
pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    pub fn database_error(context: StoreOperationContext, error: SqlxError) -> SchedulerError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) if db_error.is_unique_violation() => {
                return SchedulerError::already_exists(
                    context.entity,
                    context.key.unwrap_or_default(),
                );
            }
            SqlxError::Database(db_error) => {
                format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}")
            }
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        };

        debug!(error = %error, "{}", error_msg);
        SchedulerError::persistence_with_source(error_msg, error)
    }

    /// 读取行数据失败（列缺失、格式错误）
    pub fn mapping_error(context: StoreOperationContext, message: impl fmt::Display) -> SchedulerError {
        SchedulerError::persistence(format!(
            "{}{}时解析数据失败: {message}",
            context.operation,
            context.entity_description()
        ))
    }
}
