//! Connection lifecycle events.
//!
//! Every lifecycle transition and quality update is appended to a bounded
//! history and handed synchronously to subscribers.

use crate::connection::ConnectionQuality;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// History size that triggers trimming
pub const MAX_EVENTS: usize = 1000;

/// History size kept after trimming
pub const TRIMMED_EVENTS: usize = 500;

/// Default `get_events` limit
pub const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEventType {
    Connected,
    Disconnected,
    Error,
    QualityChanged,
    Reconnecting,
}

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` or `force_reconnect()` was called
    Requested,
    /// The peer closed the socket or a read failed
    ConnectionLost,
}

/// Event payload, serialized as `{"type": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NetworkEventKind {
    Connected {
        host: String,
        port: u16,
    },
    Disconnected {
        host: String,
        port: u16,
        reason: DisconnectReason,
    },
    Error {
        operation: String,
    },
    QualityChanged(ConnectionQuality),
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        host: String,
        port: u16,
        attempt: u32,
        delay_ms: u64,
    },
}

impl NetworkEventKind {
    pub fn event_type(&self) -> NetworkEventType {
        match self {
            NetworkEventKind::Connected { .. } => NetworkEventType::Connected,
            NetworkEventKind::Disconnected { .. } => NetworkEventType::Disconnected,
            NetworkEventKind::Error { .. } => NetworkEventType::Error,
            NetworkEventKind::QualityChanged(_) => NetworkEventType::QualityChanged,
            NetworkEventKind::Reconnecting { .. } => NetworkEventType::Reconnecting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NetworkEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NetworkEvent {
    pub fn event_type(&self) -> NetworkEventType {
        self.kind.event_type()
    }
}

/// Callback type for event subscribers
pub type EventCallback = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Bounded event history with synchronous fan-out.
pub struct EventBus {
    events: Mutex<VecDeque<NetworkEvent>>,
    subscribers: RwLock<Vec<(SubscriptionId, EventCallback)>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Record an event and notify subscribers before returning.
    pub fn publish(&self, kind: NetworkEventKind, message: Option<String>) -> NetworkEvent {
        let event = NetworkEvent {
            timestamp: Utc::now(),
            kind,
            message,
        };
        tracing::debug!("Event {:?}: {:?}", event.event_type(), event.message);

        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.push_back(event.clone());
            if events.len() > MAX_EVENTS {
                let excess = events.len() - TRIMMED_EVENTS;
                events.drain(..excess);
            }
        }

        // Snapshot so callbacks may subscribe or publish themselves.
        let subscribers: Vec<EventCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in subscribers {
            callback(&event);
        }

        event
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&NetworkEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// The newest `limit` events, oldest first.
    pub fn get_events(&self, limit: usize) -> Vec<NetworkEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn error_event(n: usize) -> NetworkEventKind {
        NetworkEventKind::Error {
            operation: format!("op-{}", n),
        }
    }

    fn operation(event: &NetworkEvent) -> String {
        match &event.kind {
            NetworkEventKind::Error { operation } => operation.clone(),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_get_events_is_chronological_and_limited() {
        let bus = EventBus::new();
        for n in 0..10 {
            bus.publish(error_event(n), None);
        }

        let events = bus.get_events(3);
        let ops: Vec<String> = events.iter().map(operation).collect();
        assert_eq!(ops, vec!["op-7", "op-8", "op-9"]);
        assert_eq!(bus.get_events(DEFAULT_EVENT_LIMIT).len(), 10);
    }

    #[test]
    fn test_history_trims_to_half() {
        let bus = EventBus::new();
        for n in 0..MAX_EVENTS {
            bus.publish(error_event(n), None);
        }
        assert_eq!(bus.len(), MAX_EVENTS);

        bus.publish(error_event(MAX_EVENTS), None);
        assert_eq!(bus.len(), TRIMMED_EVENTS);

        let newest = bus.get_events(1);
        assert_eq!(operation(&newest[0]), format!("op-{}", MAX_EVENTS));
        let oldest = bus.get_events(TRIMMED_EVENTS);
        assert_eq!(operation(&oldest[0]), format!("op-{}", MAX_EVENTS + 1 - TRIMMED_EVENTS));
    }

    #[test]
    fn test_subscribers_are_notified_synchronously() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.subscribe(move |event| {
            assert_eq!(event.event_type(), NetworkEventType::Error);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(error_event(0), Some("boom".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(error_event(1), None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serialization_shape() {
        let bus = EventBus::new();
        let event = bus.publish(
            NetworkEventKind::Reconnecting {
                host: "10.0.0.2".to_string(),
                port: 4045,
                attempt: 2,
                delay_ms: 4000,
            },
            None,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reconnecting");
        assert_eq!(json["data"]["attempt"], 2);
        assert_eq!(json["data"]["delayMs"], 4000);
        assert!(json.get("timestamp").is_some());
        assert!(json.get("message").is_none());
    }
}
