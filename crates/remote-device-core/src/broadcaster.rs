//! Channel-routed publish/subscribe bus with recent-history rings.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    error::{Coded, ErrorCode},
    event::{Channel, Event, LogEntry, LogLevel, LogQuery, UnsupportedChannel, topics},
};

/// Recent-activity ring size.
pub const ACTIVITY_CAPACITY: usize = 20;
/// Structured log ring size.
pub const LOG_CAPACITY: usize = 500;
/// Per-observer queue depth; events beyond it are dropped for that observer.
const OBSERVER_BUFFER: usize = 256;

/// Observer identifier.
pub type ObserverId = Uuid;

/// Broadcaster error.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error(transparent)]
    UnsupportedChannel(#[from] UnsupportedChannel),
    #[error("Observer not registered: {0}")]
    UnknownObserver(ObserverId),
}

impl Coded for BroadcastError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedChannel(_) => ErrorCode::UnsupportedChannel,
            Self::UnknownObserver(_) => ErrorCode::Internal,
        }
    }
}

struct Observer {
    channels: HashSet<Channel>,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    activity: VecDeque<Event>,
    logs: VecDeque<LogEntry>,
    observers: HashMap<ObserverId, Observer>,
}

/// A registered observer: its id and the queue its events arrive on.
pub struct ObserverHandle {
    pub id: ObserverId,
    pub events: mpsc::Receiver<Event>,
}

/// Process-wide event bus.
///
/// `publish` never blocks: each observer has a bounded queue and an event
/// that does not fit is dropped for that observer only. Observers that went
/// away are pruned on the next publish.
pub struct EventBroadcaster {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Event>,
    activity_capacity: usize,
    log_capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    /// Create a broadcaster with the default ring sizes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(ACTIVITY_CAPACITY, LOG_CAPACITY)
    }

    /// Create a broadcaster with custom ring sizes.
    #[must_use]
    pub fn with_capacity(activity_capacity: usize, log_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                activity: VecDeque::with_capacity(activity_capacity),
                logs: VecDeque::with_capacity(32),
                observers: HashMap::new(),
            }),
            sender,
            activity_capacity,
            log_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to every observer subscribed to the topic's channel.
    pub fn publish(&self, topic: impl Into<String>, data: Value) {
        self.dispatch(Event::new(topic, data), true);
    }

    fn dispatch(&self, event: Event, record: bool) {
        let _ = self.sender.send(event.clone());
        let channel = event.channel();

        let mut inner = self.write();
        if record && self.activity_capacity > 0 {
            if inner.activity.len() >= self.activity_capacity {
                inner.activity.pop_front();
            }
            inner.activity.push_back(event.clone());
        }

        let Some(channel) = channel else {
            return;
        };

        let mut closed = Vec::new();
        for (id, observer) in &inner.observers {
            if !observer.channels.contains(&channel) {
                continue;
            }
            match observer.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(observer = %id, topic = %event.topic, "Observer lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            inner.observers.remove(&id);
        }
    }

    /// Record a structured log line and publish it on the `logs` channel.
    pub fn log(&self, level: LogLevel, source: &str, message: impl Into<String>, fields: Value) {
        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            source: source.to_string(),
            message: message.into(),
            fields,
        };

        {
            let mut inner = self.write();
            if self.log_capacity > 0 {
                if inner.logs.len() >= self.log_capacity {
                    inner.logs.pop_front();
                }
                inner.logs.push_back(entry.clone());
            }
        }

        let data = serde_json::to_value(&entry).unwrap_or(Value::Null);
        self.dispatch(Event::new(topics::LOG_ENTRY, data), false);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, source, message, Value::Null);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, source, message, Value::Null);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, source, message, Value::Null);
    }

    /// Register a new observer with no subscriptions.
    #[must_use]
    pub fn register_observer(&self) -> ObserverHandle {
        let id = Uuid::new_v4();
        let (tx, events) = mpsc::channel(OBSERVER_BUFFER);
        self.write().observers.insert(
            id,
            Observer {
                channels: HashSet::new(),
                tx,
            },
        );
        ObserverHandle { id, events }
    }

    /// Drop an observer and all its subscriptions.
    pub fn remove_observer(&self, id: ObserverId) {
        self.write().observers.remove(&id);
    }

    /// Subscribe an observer to a channel by name.
    ///
    /// # Errors
    /// Returns error if the channel is not on the allow-list or the observer
    /// is unknown.
    pub fn subscribe(&self, id: ObserverId, channel: &str) -> Result<Channel, BroadcastError> {
        let channel: Channel = channel.parse()?;
        let mut inner = self.write();
        let observer = inner
            .observers
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownObserver(id))?;
        observer.channels.insert(channel);
        Ok(channel)
    }

    /// Unsubscribe an observer from a channel by name.
    ///
    /// # Errors
    /// Returns error if the channel is not on the allow-list or the observer
    /// is unknown.
    pub fn unsubscribe(&self, id: ObserverId, channel: &str) -> Result<Channel, BroadcastError> {
        let channel: Channel = channel.parse()?;
        let mut inner = self.write();
        let observer = inner
            .observers
            .get_mut(&id)
            .ok_or(BroadcastError::UnknownObserver(id))?;
        observer.channels.remove(&channel);
        Ok(channel)
    }

    /// Channels an observer is subscribed to.
    #[must_use]
    pub fn subscriptions(&self, id: ObserverId) -> Vec<Channel> {
        self.read()
            .observers
            .get(&id)
            .map(|o| {
                Channel::ALL
                    .into_iter()
                    .filter(|c| o.channels.contains(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.read().observers.len()
    }

    /// Most recent events, oldest first.
    #[must_use]
    pub fn recent_activity(&self, limit: Option<usize>) -> Vec<Event> {
        let inner = self.read();
        let skip = limit.map_or(0, |l| inner.activity.len().saturating_sub(l));
        inner.activity.iter().skip(skip).cloned().collect()
    }

    /// Most recent log lines matching the query, oldest first.
    #[must_use]
    pub fn recent_logs(&self, query: &LogQuery) -> Vec<LogEntry> {
        let inner = self.read();
        let matching: Vec<&LogEntry> = inner.logs.iter().filter(|e| query.matches(e)).collect();
        let skip = query.limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Receiver for every event regardless of channel.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Stream that yields the recent-activity ring first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, Event> {
        let (history, rx) = (self.recent_activity(None), self.subscribe_all());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
