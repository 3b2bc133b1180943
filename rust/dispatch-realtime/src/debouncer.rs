//! Duplicate-delivery suppression for change events.
//!
//! The change feed may hand the same row change to a subscription more than
//! once (overlapping channels during a reconnect, server-side replays). The
//! [`EventDebouncer`] remembers each event token for one debounce interval
//! and drops repeats inside that window.

use crate::config::DebounceConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SeenEvents {
    seen: HashMap<String, Instant>,
}

impl SeenEvents {
    fn purge_expired(&mut self, now: Instant, interval: Duration) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < interval);
        before - self.seen.len()
    }

    /// Keep only the most recent half of the remembered tokens.
    fn trim_to_recent_half(&mut self, max_events: usize) {
        let keep = max_events / 2;
        let mut entries: Vec<(String, Instant)> = self.seen.drain().collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(keep);
        self.seen.extend(entries);
    }
}

pub struct EventDebouncer {
    config: DebounceConfig,
    state: Arc<Mutex<SeenEvents>>,
    sweeper: Option<JoinHandle<()>>,
}

impl EventDebouncer {
    /// Create a debouncer without a background sweep. Memory stays bounded
    /// by `max_events` either way.
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SeenEvents::default())),
            sweeper: None,
        }
    }

    /// Create a debouncer whose expired tokens are purged every
    /// `cleanup_interval`. Must be called inside a tokio runtime; the sweep
    /// task lives until [`dispose`](Self::dispose) or drop.
    pub fn with_periodic_sweep(config: DebounceConfig) -> Self {
        let mut debouncer = Self::new(config);
        let state = Arc::downgrade(&debouncer.state);
        let interval = debouncer.config.interval;
        let period = debouncer.config.cleanup_interval;

        debouncer.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let purged = lock(&state).purge_expired(Instant::now(), interval);
                if purged > 0 {
                    tracing::debug!(purged, "purged expired event tokens");
                }
            }
        }));

        debouncer
    }

    /// Returns `true` the first time `token` is seen within the debounce
    /// window and records it; returns `false` for a repeat inside the window
    /// without touching the stored timestamp.
    pub fn should_process_event(&self, token: &str, at: Option<Instant>) -> bool {
        let now = at.unwrap_or_else(Instant::now);
        let mut state = lock(&self.state);

        if let Some(seen_at) = state.seen.get(token) {
            if now.saturating_duration_since(*seen_at) < self.config.interval {
                return false;
            }
        }

        state.seen.insert(token.to_string(), now);
        if state.seen.len() > self.config.max_events {
            state.trim_to_recent_half(self.config.max_events);
            tracing::debug!(
                remaining = state.seen.len(),
                "event token store over capacity, trimmed"
            );
        }

        true
    }

    /// Drop tokens older than the debounce interval.
    pub fn purge_expired(&self) -> usize {
        lock(&self.state).purge_expired(Instant::now(), self.config.interval)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_sweeper(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the sweep task and forget every token.
    pub fn dispose(&mut self) {
        if let Some(task) = self.sweeper.take() {
            task.abort();
        }
        lock(&self.state).seen.clear();
    }
}

impl Drop for EventDebouncer {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.take() {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<SeenEvents>) -> MutexGuard<'_, SeenEvents> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
