//! Shared database mapping utilities
//!
//! 时间统一以 UTC 毫秒整数存储，JSON 字段以 TEXT 存储。

use chrono::{DateTime, TimeZone, Utc};
use scheduler_domain::{GroupMatcher, TriggerState};
use scheduler_errors::{SchedulerError, SchedulerResult};
use serde::de::DeserializeOwned;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};
use std::str::FromStr;

/// Helper functions for parsing database fields
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn opt_to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(|t| t.timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| SchedulerError::persistence(format!("无效的时间戳: {millis}")))
    }

    pub fn time(row: &SqliteRow, field_name: &str) -> SchedulerResult<DateTime<Utc>> {
        let millis: i64 = row.try_get(field_name)?;
        Self::from_millis(millis)
    }

    pub fn opt_time(row: &SqliteRow, field_name: &str) -> SchedulerResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = row.try_get(field_name)?;
        millis.map(Self::from_millis).transpose()
    }

    /// 解析以字符串存储的枚举
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T>
    where
        T: FromStr<Err = String>,
    {
        let value: String = row.try_get(field_name)?;
        value
            .parse()
            .map_err(|e: String| SchedulerError::persistence(format!("字段 {field_name}: {e}")))
    }

    pub fn parse_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
    }

    /// 追加分组过滤条件，`Equals` 使用等值比较，其余使用 LIKE
    pub fn push_group_filter(
        builder: &mut QueryBuilder<'_, Sqlite>,
        column: &str,
        matcher: &GroupMatcher,
    ) {
        match matcher {
            GroupMatcher::Equals(group) => {
                builder.push(format!(" AND {column} = "));
                builder.push_bind(group.clone());
            }
            other => {
                let pattern = other.to_like_pattern().unwrap_or_else(|| "%".to_string());
                builder.push(format!(" AND {column} LIKE "));
                builder.push_bind(pattern);
                builder.push(" ESCAPE '\\'");
            }
        }
    }

    /// 追加 `trigger_state IN (...)` 条件
    pub fn push_state_filter(builder: &mut QueryBuilder<'_, Sqlite>, states: &[TriggerState]) {
        if states.is_empty() {
            builder.push(" AND 1 = 0");
            return;
        }
        builder.push(" AND trigger_state IN (");
        let mut separated = builder.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        separated.push_unseparated(")");
    }
}
