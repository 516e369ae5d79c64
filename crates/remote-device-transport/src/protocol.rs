//! Wire protocol for observer connections.

use chrono::{DateTime, Utc};
use remote_device_core::{
    Channel, Coded, ErrorBody, ErrorCode, Event, ExecutionResult, LogEntry, LogQuery,
};
use remote_device_engine::EngineStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from observer to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events of a channel.
    Subscribe { channel: String },
    /// Stop receiving events of a channel.
    Unsubscribe { channel: String },
    /// Fetch the recent-activity ring.
    GetRecentActivity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    /// Fetch structured log lines.
    GetLogs {
        #[serde(flatten)]
        query: LogQuery,
    },
    GetStatus,
    /// Run a registered task now.
    RunTask { name: String },
    /// Ping for keepalive.
    Ping,
}

/// Message from server to observer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A broadcast event on a subscribed channel.
    Event {
        topic: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        channel: Channel,
        channels: Vec<Channel>,
    },
    Unsubscribed {
        channel: Channel,
        channels: Vec<Channel>,
    },
    RecentActivity { events: Vec<Event> },
    Logs { entries: Vec<LogEntry> },
    Status { status: EngineStatus },
    TaskResult { result: ExecutionResult },
    Error { code: ErrorCode, message: String },
    Pong,
}

impl ServerMessage {
    /// Error reply for any coded failure.
    #[must_use]
    pub fn error(err: &impl Coded) -> Self {
        err.to_body().into()
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        Self::Event {
            topic: event.topic,
            data: event.data,
            timestamp: event.timestamp,
        }
    }
}

impl From<ErrorBody> for ServerMessage {
    fn from(body: ErrorBody) -> Self {
        Self::Error {
            code: body.code,
            message: body.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use remote_device_core::{DeviceError, LogLevel};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"tasks"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { channel: "tasks".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_recent_activity"}"#).unwrap();
        assert_eq!(msg, ClientMessage::GetRecentActivity { limit: None });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"get_logs","limit":5,"level":"warn"}"#).unwrap();
        let ClientMessage::GetLogs { query } = msg else {
            panic!("Wrong message type");
        };
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.level, Some(LogLevel::Warn));
        assert_eq!(query.since, None);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let msg = ServerMessage::from(Event::new("task:completed", json!({"name": "morning"})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["topic"], "task:completed");
        assert_eq!(value["data"]["name"], "morning");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_error_carries_code() {
        let value = serde_json::to_value(ServerMessage::error(&DeviceError::NotConnected)).unwrap();
        assert_eq!(value, json!({
            "type": "error",
            "code": "DEVICE_NOT_CONNECTED",
            "message": "Device not connected",
        }));
    }
}
