//! The realtime backend contract and its implementations.
//!
//! The engine never talks to a transport directly. It asks a
//! [`RealtimeBackend`] to join a named channel with a set of change
//! bindings; the backend reports the join outcome and every row change
//! through the [`ChannelSink`] it was handed.
//!
//! - [`memory::MemoryBackend`] - scriptable in-process backend
//! - [`phoenix::PhoenixBackend`] - hosted realtime WebSocket protocol
//! - [`publication`] - enabling the server-side change feed per table

pub mod memory;
pub mod phoenix;
pub mod publication;

use crate::error::{RealtimeError, Result};
use crate::event::ChangeEvent;
use crate::key::{EventFilter, SubscriptionKey};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

pub use memory::MemoryBackend;
pub use phoenix::{PhoenixBackend, PhoenixConfig};
pub use publication::{HttpPublicationEnabler, NoopEnabler, PublicationEnabler};

/// Outcome reported for a channel join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError(String),
    TimedOut,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::Closed => "CLOSED",
            ChannelStatus::ChannelError(_) => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
        }
    }

    /// The error a non-`SUBSCRIBED` outcome stands for on `key`'s channel.
    pub fn failure(&self, key: &SubscriptionKey) -> Option<RealtimeError> {
        match self {
            ChannelStatus::Subscribed => None,
            ChannelStatus::Closed => Some(RealtimeError::ConnectionClosed),
            ChannelStatus::ChannelError(reason) => Some(RealtimeError::ChannelRejected {
                topic: key.to_string(),
                reason: reason.clone(),
            }),
            ChannelStatus::TimedOut => Some(RealtimeError::ConnectionFailed(format!(
                "join of {} timed out",
                key
            ))),
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::ChannelError(reason) => write!(f, "CHANNEL_ERROR ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One change listener attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChangeBinding {
    pub event: EventFilter,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeBinding {
    pub fn for_key(key: &SubscriptionKey, schema: &str) -> Self {
        Self {
            event: key.event(),
            schema: schema.to_string(),
            table: key.table_name().to_string(),
            filter: key.filter().map(|f| f.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub name: String,
    pub bindings: Vec<ChangeBinding>,
}

/// Opaque reference to a joined channel, used to remove it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: u64,
    topic: String,
}

impl ChannelHandle {
    pub fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ChannelPayload {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelMessage {
    pub key: SubscriptionKey,
    pub generation: u64,
    pub payload: ChannelPayload,
}

/// Where a backend delivers everything that happens on one channel join.
///
/// Each sink is bound to a single subscribe attempt; messages it carries
/// are tagged with that attempt so the engine can discard late callbacks
/// from superseded attempts.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    key: SubscriptionKey,
    generation: u64,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelSink {
    pub(crate) fn new(
        key: SubscriptionKey,
        generation: u64,
        tx: mpsc::UnboundedSender<ChannelMessage>,
    ) -> Self {
        Self {
            key,
            generation,
            tx,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a join outcome. Returns `false` once the engine is gone.
    pub fn status(&self, status: ChannelStatus) -> bool {
        self.send(ChannelPayload::Status(status))
    }

    /// Deliver a row change. Returns `false` once the engine is gone.
    pub fn change(&self, event: ChangeEvent) -> bool {
        self.send(ChannelPayload::Change(event))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, payload: ChannelPayload) -> bool {
        self.tx
            .send(ChannelMessage {
                key: self.key.clone(),
                generation: self.generation,
                payload,
            })
            .is_ok()
    }
}

/// Transport able to join and leave change-feed channels.
///
/// `subscribe` must return as soon as the join has been issued; the join
/// outcome is reported later through the sink.
#[async_trait]
pub trait RealtimeBackend: Send + Sync + 'static {
    async fn subscribe(&self, request: ChannelRequest, sink: ChannelSink)
        -> Result<ChannelHandle>;

    async fn remove_channel(&self, handle: &ChannelHandle) -> Result<()>;
}

#[cfg(test)]
pub(crate) fn detached_sink(
    key: SubscriptionKey,
    generation: u64,
) -> (ChannelSink, mpsc::UnboundedReceiver<ChannelMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink::new(key, generation, tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_failure_names_the_channel() {
        let key = SubscriptionKey::table("missions", EventFilter::All, None);
        assert!(ChannelStatus::Subscribed.failure(&key).is_none());

        let rejected = ChannelStatus::ChannelError("unauthorized".into()).failure(&key).unwrap();
        assert!(matches!(rejected, RealtimeError::ChannelRejected { .. }));
        assert_eq!(rejected.to_string(), "Channel table:missions:* rejected: unauthorized");

        assert!(matches!(
            ChannelStatus::Closed.failure(&key),
            Some(RealtimeError::ConnectionClosed)
        ));
        let timed_out = ChannelStatus::TimedOut.failure(&key).unwrap();
        assert!(timed_out.to_string().contains("table:missions:*"));
    }
}
