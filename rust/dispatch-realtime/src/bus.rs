use crate::key::SubscriptionKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Availability states an interpreter profile can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterStatus {
    Available,
    Busy,
    Pause,
    Unavailable,
}

impl InterpreterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpreterStatus::Available => "available",
            InterpreterStatus::Busy => "busy",
            InterpreterStatus::Pause => "pause",
            InterpreterStatus::Unavailable => "unavailable",
        }
    }

    /// `None` for anything outside the tracked set.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for InterpreterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterpreterStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(InterpreterStatus::Available),
            "busy" => Ok(InterpreterStatus::Busy),
            "pause" => Ok(InterpreterStatus::Pause),
            "unavailable" => Ok(InterpreterStatus::Unavailable),
            _ => Err(()),
        }
    }
}

/// Application-wide notifications emitted by the realtime engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Debounced aggregate connectivity changed.
    ConnectionStatusChanged { connected: bool },
    InterpreterStatusChanged {
        interpreter_id: String,
        status: InterpreterStatus,
    },
    /// A subscription used up its retries and stopped reconnecting.
    SubscriptionExhausted { key: SubscriptionKey, attempts: u32 },
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::ConnectionStatusChanged { .. } => "connection-status-changed",
            RealtimeEvent::InterpreterStatusChanged { .. } => "interpreter-status-changed",
            RealtimeEvent::SubscriptionExhausted { .. } => "subscription-exhausted",
        }
    }
}

/// Broadcast bus for [`RealtimeEvent`]s.
///
/// Publishing never blocks; receivers that fall behind observe
/// `RecvError::Lagged` and skip ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of receivers reached.
    pub fn publish(&self, event: RealtimeEvent) -> usize {
        tracing::trace!(event = event.name(), "publishing realtime event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<RealtimeEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            InterpreterStatus::from_value(&json!("busy")),
            Some(InterpreterStatus::Busy)
        );
        assert_eq!(InterpreterStatus::from_value(&json!("offline")), None);
        assert_eq!(InterpreterStatus::from_value(&json!(3)), None);
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(RealtimeEvent::ConnectionStatusChanged { connected: true }), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let bus = EventBus::new();
        let mut stream = bus.stream();
        bus.publish(RealtimeEvent::InterpreterStatusChanged {
            interpreter_id: "u-7".to_string(),
            status: InterpreterStatus::Pause,
        });

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.name(), "interpreter-status-changed");
    }
}
