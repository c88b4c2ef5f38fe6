use serde::{Deserialize, Serialize};
use std::fmt;

/// 默认分组名
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// 表示“所有分组均已暂停”的合成分组名
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

/// 启动恢复时生成的恢复触发器所在分组
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";

/// 作业标识 (name, group)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// 使用默认分组创建
    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// 触发器标识 (name, group)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// 分组匹配器
///
/// 用于按分组名批量查询、暂停、恢复作业和触发器。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Anything,
}

impl GroupMatcher {
    pub fn group_equals(group: impl Into<String>) -> Self {
        GroupMatcher::Equals(group.into())
    }

    pub fn is_match(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Equals(v) => group == v,
            GroupMatcher::StartsWith(v) => group.starts_with(v.as_str()),
            GroupMatcher::EndsWith(v) => group.ends_with(v.as_str()),
            GroupMatcher::Contains(v) => group.contains(v.as_str()),
            GroupMatcher::Anything => true,
        }
    }

    /// 转换为SQL LIKE模式，`Equals` 返回 None 表示使用等值比较
    pub fn to_like_pattern(&self) -> Option<String> {
        match self {
            GroupMatcher::Equals(_) => None,
            GroupMatcher::StartsWith(v) => Some(format!("{}%", escape_like(v))),
            GroupMatcher::EndsWith(v) => Some(format!("%{}", escape_like(v))),
            GroupMatcher::Contains(v) => Some(format!("%{}%", escape_like(v))),
            GroupMatcher::Anything => Some("%".to_string()),
        }
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
