//! Live-tail fan-out hub.
//!
//! Subscribers register with a [`LabelSet`] filter (empty filter matches
//! everything) and get back a bounded channel of [`TailMessage`]s. A
//! subscriber matches an entry iff the entry's labels are a superset of
//! the subscriber's filter. `broadcast` is always non-blocking: a full
//! subscriber channel drops the new entry and logs a warning rather than
//! stalling the hub or the ingest path that called it.
//!
//! Each subscriber owns its own bounded queue and is drained by its own
//! transport-side writer task (outside this module, see the HTTP layer's
//! `/stream` handler), so one slow subscriber can never stall delivery to
//! the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::chunk_store::LogEntry;
use crate::labels::LabelSet;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

pub type SubscriberId = u64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TailMessage {
    Connected {
        message: String,
        filter: LabelSet,
    },
    Log {
        data: TailLogData,
    },
    FilterUpdated {
        filter: LabelSet,
    },
}

/// An in-band control frame a subscriber may send back over the `/stream`
/// transport's request body to replace its filter mid-connection (§4.6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Filter { labels: LabelSet },
}

#[derive(Debug, Clone, Serialize)]
pub struct TailLogData {
    pub id: u64,
    pub timestamp: String,
    pub message: String,
    pub labels: LabelSet,
    pub level: String,
}

impl TailLogData {
    pub fn from_entry(entry: &LogEntry) -> Self {
        let level = entry.labels.get("level").unwrap_or("info").to_string();
        TailLogData {
            id: entry.id,
            timestamp: crate::time::format_timestamp_ms(entry.timestamp_ms),
            message: entry.line.clone(),
            labels: entry.labels.clone(),
            level,
        }
    }
}

struct Subscriber {
    filter: LabelSet,
    sender: tokio::sync::mpsc::Sender<TailMessage>,
}

#[derive(Default)]
pub struct TailHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl TailHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with `filter`, sending it the initial
    /// `connected` message, and returns its id and receiver half.
    pub fn register(&self, filter: LabelSet) -> (SubscriberId, tokio::sync::mpsc::Receiver<TailMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = tokio::sync::mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        let _ = sender.try_send(TailMessage::Connected {
            message: "connected to live tail".to_string(),
            filter: filter.clone(),
        });

        self.subscribers
            .write()
            .expect("tail hub lock poisoned")
            .insert(id, Subscriber { filter, sender });

        (id, receiver)
    }

    pub fn unregister(&self, id: SubscriberId) {
        self.subscribers
            .write()
            .expect("tail hub lock poisoned")
            .remove(&id);
    }

    /// Replaces a subscriber's filter in place, notifying it of the
    /// change. No-op if the subscriber already disconnected.
    pub fn update_filter(&self, id: SubscriberId, filter: LabelSet) {
        let mut subscribers = self.subscribers.write().expect("tail hub lock poisoned");
        if let Some(subscriber) = subscribers.get_mut(&id) {
            subscriber.filter = filter.clone();
            let _ = subscriber
                .sender
                .try_send(TailMessage::FilterUpdated { filter });
        }
    }

    /// Fans `entry` out to every matching subscriber. Non-blocking: a
    /// full or closed subscriber queue is dropped (and, if closed,
    /// unregistered) without blocking the caller.
    pub fn broadcast(&self, entry: &LogEntry) {
        let subscribers = self.subscribers.read().expect("tail hub lock poisoned");
        let mut dead = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !entry.labels.matches(&subscriber.filter) {
                continue;
            }
            let message = TailMessage::Log {
                data: TailLogData::from_entry(entry),
            };
            match subscriber.sender.try_send(message) {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    warn!("live-tail subscriber {} queue full, dropping entry", id);
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        drop(subscribers);

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().expect("tail hub lock poisoned");
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("tail hub lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(labels: LabelSet) -> LogEntry {
        LogEntry {
            id: 1,
            timestamp_ms: 0,
            line: "hello".to_string(),
            labels,
        }
    }

    #[test]
    fn control_message_filter_frame_deserializes() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"filter","labels":{"service":"api"}}"#).unwrap();
        let ControlMessage::Filter { labels } = msg;
        assert_eq!(labels.get("service"), Some("api"));
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[tokio::test]
    async fn empty_filter_matches_everything() {
        let hub = TailHub::new();
        let (_, mut rx) = hub.register(LabelSet::new());
        let _connected = rx.recv().await.unwrap();

        hub.broadcast(&entry(labels(&[("service", "api")])));
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TailMessage::Log { .. }));
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_entries() {
        let hub = TailHub::new();
        let (_, mut rx) = hub.register(labels(&[("service", "api")]));
        let _connected = rx.recv().await.unwrap();

        hub.broadcast(&entry(labels(&[("service", "auth")])));
        hub.broadcast(&entry(labels(&[("service", "api")])));

        let msg = rx.recv().await.unwrap();
        match msg {
            TailMessage::Log { data } => assert_eq!(data.labels.get("service"), Some("api")),
            _ => panic!("expected log message"),
        }
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = TailHub::new();
        let (id, _rx) = hub.register(LabelSet::new());
        assert_eq!(hub.subscriber_count(), 1);
        hub.unregister(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn update_filter_is_observed_on_next_broadcast() {
        let hub = TailHub::new();
        let (id, mut rx) = hub.register(labels(&[("service", "api")]));
        let _connected = rx.recv().await.unwrap();

        hub.update_filter(id, labels(&[("service", "auth")]));
        let update_msg = rx.recv().await.unwrap();
        assert!(matches!(update_msg, TailMessage::FilterUpdated { .. }));

        hub.broadcast(&entry(labels(&[("service", "auth")])));
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TailMessage::Log { .. }));
    }
}
