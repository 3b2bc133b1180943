//! In-process backend for tests and demos.
//!
//! Every `subscribe` call is recorded in open order together with the sink
//! it was given, so a test can play the server: acknowledge or fail a join,
//! push row changes, or replay stale callbacks on a channel that was
//! already removed.

use super::{ChannelHandle, ChannelRequest, ChannelSink, ChannelStatus, RealtimeBackend};
use crate::error::{RealtimeError, Result};
use crate::event::ChangeEvent;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

struct MemoryChannel {
    handle: ChannelHandle,
    request: ChannelRequest,
    sink: ChannelSink,
    removed: bool,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    auto_ack: bool,
    fail_next: usize,
    attempts: usize,
    removals: usize,
    channels: Vec<MemoryChannel>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Joins stay pending until a status is emitted explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins are acknowledged with `SUBSCRIBED` as soon as they are issued.
    pub fn auto_ack() -> Self {
        let backend = Self::default();
        backend.set_auto_ack(true);
        backend
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.lock().auto_ack = enabled;
    }

    /// Reject the next `count` subscribe calls outright.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Subscribe calls made, including rejected ones.
    pub fn attempt_count(&self) -> usize {
        self.lock().attempts
    }

    /// Channels successfully opened over the backend's lifetime.
    pub fn open_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn remove_count(&self) -> usize {
        self.lock().removals
    }

    pub fn live_count(&self) -> usize {
        self.lock().channels.iter().filter(|c| !c.removed).count()
    }

    /// Number of channels ever opened under `name`.
    pub fn opens_for(&self, name: &str) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|c| c.request.name == name)
            .count()
    }

    pub fn request(&self, index: usize) -> Option<ChannelRequest> {
        self.lock().channels.get(index).map(|c| c.request.clone())
    }

    pub fn is_removed(&self, index: usize) -> bool {
        self.lock().channels.get(index).is_some_and(|c| c.removed)
    }

    /// Open-order index of the newest live channel named `name`.
    pub fn latest(&self, name: &str) -> Option<usize> {
        self.lock()
            .channels
            .iter()
            .rposition(|c| c.request.name == name && !c.removed)
    }

    /// Emit a status on the channel opened `index`-th, removed or not.
    pub fn emit_status(&self, index: usize, status: ChannelStatus) -> bool {
        let sink = self.lock().channels.get(index).map(|c| c.sink.clone());
        sink.is_some_and(|sink| sink.status(status))
    }

    pub fn emit_change(&self, index: usize, event: ChangeEvent) -> bool {
        let sink = self.lock().channels.get(index).map(|c| c.sink.clone());
        sink.is_some_and(|sink| sink.change(event))
    }

    /// Emit a status on the newest live channel named `name`.
    pub fn emit_status_on(&self, name: &str, status: ChannelStatus) -> bool {
        match self.latest(name) {
            Some(index) => self.emit_status(index, status),
            None => false,
        }
    }

    pub fn emit_change_on(&self, name: &str, event: ChangeEvent) -> bool {
        match self.latest(name) {
            Some(index) => self.emit_change(index, event),
            None => false,
        }
    }

    /// Report `CLOSED` on every live channel, as a dropped socket would.
    pub fn drop_all(&self) -> usize {
        let sinks: Vec<ChannelSink> = self
            .lock()
            .channels
            .iter()
            .filter(|c| !c.removed)
            .map(|c| c.sink.clone())
            .collect();

        sinks
            .into_iter()
            .filter(|sink| sink.status(ChannelStatus::Closed))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RealtimeBackend for MemoryBackend {
    async fn subscribe(
        &self,
        request: ChannelRequest,
        sink: ChannelSink,
    ) -> Result<ChannelHandle> {
        let mut state = self.lock();
        state.attempts += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RealtimeError::ConnectionFailed(format!(
                "scripted failure joining {}",
                request.name
            )));
        }

        state.next_id += 1;
        let handle = ChannelHandle::new(state.next_id, format!("realtime:{}", request.name));
        if state.auto_ack {
            sink.status(ChannelStatus::Subscribed);
        }

        state.channels.push(MemoryChannel {
            handle: handle.clone(),
            request,
            sink,
            removed: false,
        });

        Ok(handle)
    }

    async fn remove_channel(&self, handle: &ChannelHandle) -> Result<()> {
        let mut state = self.lock();
        let removed = match state
            .channels
            .iter_mut()
            .find(|c| &c.handle == handle && !c.removed)
        {
            Some(channel) => {
                channel.removed = true;
                true
            }
            None => false,
        };
        if removed {
            state.removals += 1;
        }
        Ok(())
    }
}
