use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(anyhow::anyhow!("不支持的日志格式: {s}")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别或完整的过滤指令，如 `info,scheduler_jobstore=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.level.trim().is_empty() {
            return Err(anyhow::anyhow!("日志级别不能为空"));
        }
        tracing_subscriber::EnvFilter::try_new(&self.level)
            .map_err(|e| anyhow::anyhow!("无效的日志级别 '{}': {e}", self.level))?;
        Ok(())
    }
}
