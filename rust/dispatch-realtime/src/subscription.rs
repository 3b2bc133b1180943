use crate::engine::Command;
use crate::key::SubscriptionKey;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to one listener on a shared subscription.
///
/// Dropping the handle (or calling [`unsubscribe`](Self::unsubscribe))
/// stops delivery to this listener immediately. The backend channel is
/// closed once the last listener for the key is gone.
pub struct RealtimeSubscription {
    key: SubscriptionKey,
    listener_id: u64,
    active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RealtimeSubscription {
    pub(crate) fn new(
        key: SubscriptionKey,
        listener_id: u64,
        active: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            key,
            listener_id,
            active,
            commands,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// `false` once unsubscribed or after the service was torn down.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {}

    fn release(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Release {
                key: self.key.clone(),
                listener_id: self.listener_id,
            });
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSubscription")
            .field("key", &self.key)
            .field("listener_id", &self.listener_id)
            .field("active", &self.is_active())
            .finish()
    }
}
