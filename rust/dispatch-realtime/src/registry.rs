use crate::backend::{ChannelHandle, RealtimeBackend};
use crate::key::SubscriptionKey;
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::warn;

/// Connection state of one logical subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub connected: bool,
    /// Retries spent since the last successful join.
    pub retry_count: u32,
    pub last_update: SystemTime,
    pub channel: Option<ChannelHandle>,
    pub callback_failures: u32,
}

impl SubscriptionStatus {
    fn new() -> Self {
        Self {
            connected: false,
            retry_count: 0,
            last_update: SystemTime::now(),
            channel: None,
            callback_failures: 0,
        }
    }

    /// Alias of `connected`.
    pub fn is_active(&self) -> bool {
        self.connected
    }
}

/// Keyed table of live subscriptions and their channels.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionKey, SubscriptionStatus>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `key` if missing; an existing entry is kept.
    pub fn register(&mut self, key: &SubscriptionKey) -> &mut SubscriptionStatus {
        self.entries
            .entry(key.clone())
            .or_insert_with(SubscriptionStatus::new)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Update connectivity; `Some(channel)` replaces the stored handle.
    /// Connecting resets the retry count. A missing entry is created;
    /// returns whether one already existed.
    pub fn update_status(
        &mut self,
        key: &SubscriptionKey,
        connected: bool,
        channel: Option<ChannelHandle>,
    ) -> bool {
        let existed = self.entries.contains_key(key);
        let status = self.register(key);
        status.connected = connected;
        status.last_update = SystemTime::now();
        if connected {
            status.retry_count = 0;
        }
        if channel.is_some() {
            status.channel = channel;
        }
        existed
    }

    pub fn take_channel(&mut self, key: &SubscriptionKey) -> Option<ChannelHandle> {
        let status = self.entries.get_mut(key)?;
        status.connected = false;
        status.last_update = SystemTime::now();
        status.channel.take()
    }

    pub fn record_retry(&mut self, key: &SubscriptionKey) -> u32 {
        match self.entries.get_mut(key) {
            Some(status) => {
                status.retry_count += 1;
                status.last_update = SystemTime::now();
                status.retry_count
            }
            None => 0,
        }
    }

    pub fn reset_retries(&mut self, key: &SubscriptionKey) {
        if let Some(status) = self.entries.get_mut(key) {
            status.retry_count = 0;
        }
    }

    pub fn record_callback_failure(&mut self, key: &SubscriptionKey) -> u32 {
        match self.entries.get_mut(key) {
            Some(status) => {
                status.callback_failures += 1;
                status.callback_failures
            }
            None => 0,
        }
    }

    /// Remove the entry and close its channel, if it has one.
    pub async fn unregister(&mut self, key: &SubscriptionKey, backend: &dyn RealtimeBackend) -> bool {
        let Some(status) = self.entries.remove(key) else {
            return false;
        };
        if let Some(channel) = status.channel {
            if let Err(e) = backend.remove_channel(&channel).await {
                warn!(key = %key, error = %e, "failed to remove channel");
            }
        }
        true
    }

    pub fn get_status(&self, key: &SubscriptionKey) -> Option<&SubscriptionStatus> {
        self.entries.get(key)
    }

    pub fn get_all_statuses(&self) -> Vec<(SubscriptionKey, SubscriptionStatus)> {
        self.entries
            .iter()
            .map(|(key, status)| (key.clone(), status.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    /// Close every channel and empty the registry.
    pub async fn cleanup_all(&mut self, backend: &dyn RealtimeBackend) -> usize {
        let keys = self.keys();
        let mut closed = 0;
        for key in keys {
            if self.unregister(&key, backend).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn get_active_count(&self) -> usize {
        self.entries.values().filter(|s| s.is_active()).count()
    }

    pub fn get_total_count(&self) -> usize {
        self.entries.len()
    }
}
