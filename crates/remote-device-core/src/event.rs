//! Broadcast events, observer channels and log lines.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic names published by the engine components.
pub mod topics {
    pub const DEVICE_CONNECTED: &str = "status:device:connected";
    pub const DEVICE_DISCONNECTED: &str = "status:device:disconnected";
    pub const DEVICE_RECONNECTING: &str = "status:device:reconnecting";

    pub const TASK_CREATED: &str = "task:created";
    pub const TASK_UPDATED: &str = "task:updated";
    pub const TASK_DELETED: &str = "task:deleted";
    pub const TASK_ENABLED: &str = "task:enabled";
    pub const TASK_DISABLED: &str = "task:disabled";
    pub const TASK_TRIGGERED: &str = "task:triggered";
    pub const TASK_COMPLETED: &str = "task:completed";
    pub const TASK_FAILED: &str = "task:failed";

    pub const LOG_ENTRY: &str = "logs:entry";
}

/// A timestamped fact for broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Channel this event is routed to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        Channel::for_topic(&self.topic)
    }
}

/// Observer-subscribable channel. The allow-list is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Status,
    Tasks,
    Logs,
}

impl Channel {
    pub const ALL: [Self; 3] = [Self::Status, Self::Tasks, Self::Logs];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Tasks => "tasks",
            Self::Logs => "logs",
        }
    }

    /// Route a `namespace:action` topic to its channel by the first segment.
    #[must_use]
    pub fn for_topic(topic: &str) -> Option<Self> {
        let namespace = topic.split(':').next().unwrap_or_default();
        match namespace {
            "status" | "device" => Some(Self::Status),
            "tasks" | "task" => Some(Self::Tasks),
            "logs" | "log" => Some(Self::Logs),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a channel name is not on the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported channel: {0} (expected one of: status, tasks, logs)")]
pub struct UnsupportedChannel(pub String);

impl FromStr for Channel {
    type Err = UnsupportedChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "tasks" => Ok(Self::Tasks),
            "logs" => Ok(Self::Logs),
            other => Err(UnsupportedChannel(other.to_string())),
        }
    }
}

/// Severity of a log line, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

/// A structured log line kept for late observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that produced the line (e.g. `connection`, `executor`).
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
}

/// Filter for the recent-logs query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Return at most this many of the most recent matching lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Only lines strictly newer than this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Minimum severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

impl LogQuery {
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(since) = self.since {
            if entry.timestamp <= since {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level < level {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_routing() {
        assert_eq!(Channel::for_topic(topics::DEVICE_CONNECTED), Some(Channel::Status));
        assert_eq!(Channel::for_topic("device:connected"), Some(Channel::Status));
        assert_eq!(Channel::for_topic(topics::TASK_FAILED), Some(Channel::Tasks));
        assert_eq!(Channel::for_topic(topics::LOG_ENTRY), Some(Channel::Logs));
        assert_eq!(Channel::for_topic("metrics:cpu"), None);
        assert_eq!(Channel::for_topic(""), None);
    }

    #[test]
    fn test_channel_allow_list() {
        assert_eq!("tasks".parse::<Channel>(), Ok(Channel::Tasks));
        let err = "metrics".parse::<Channel>().unwrap_err();
        assert!(err.to_string().contains("metrics"));
    }

    #[test]
    fn test_log_query_min_level() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            source: "executor".into(),
            message: "hello".into(),
            fields: Value::Null,
        };
        let warn_only = LogQuery {
            level: Some(LogLevel::Warn),
            ..LogQuery::default()
        };
        assert!(!warn_only.matches(&entry));
        assert!(LogQuery::default().matches(&entry));
    }
}
