//! Channel bookkeeping for the engine: opening and closing backend
//! channels, attempt generations, per-key debouncers and change-feed
//! enablement. Retry policy lives in the engine and monitor.

use crate::backend::{
    ChangeBinding, ChannelMessage, ChannelRequest, ChannelSink, PublicationEnabler, RealtimeBackend,
};
use crate::config::{DebounceConfig, RealtimeConfig};
use crate::debouncer::EventDebouncer;
use crate::error::{RealtimeError, Result};
use crate::event::ChangeEvent;
use crate::key::SubscriptionKey;
use crate::registry::SubscriptionRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct EnableOutcome {
    pub table: String,
    pub result: Result<()>,
}

pub(crate) struct SubscriptionManager {
    schema: String,
    debounce: DebounceConfig,
    backend: Arc<dyn RealtimeBackend>,
    enabler: Arc<dyn PublicationEnabler>,
    registry: SubscriptionRegistry,
    debouncers: HashMap<SubscriptionKey, EventDebouncer>,
    generations: HashMap<SubscriptionKey, u64>,
    next_generation: u64,
    enabled_tables: HashSet<String>,
    enabling: HashSet<String>,
    enable_tasks: JoinSet<()>,
    inbound_tx: mpsc::UnboundedSender<ChannelMessage>,
    enable_tx: mpsc::UnboundedSender<EnableOutcome>,
}

impl SubscriptionManager {
    pub fn new(
        config: &RealtimeConfig,
        backend: Arc<dyn RealtimeBackend>,
        enabler: Arc<dyn PublicationEnabler>,
        inbound_tx: mpsc::UnboundedSender<ChannelMessage>,
        enable_tx: mpsc::UnboundedSender<EnableOutcome>,
    ) -> Self {
        Self {
            schema: config.schema.clone(),
            debounce: config.debounce.clone(),
            backend,
            enabler,
            registry: SubscriptionRegistry::new(),
            debouncers: HashMap::new(),
            generations: HashMap::new(),
            next_generation: 0,
            enabled_tables: HashSet::new(),
            enabling: HashSet::new(),
            enable_tasks: JoinSet::new(),
            inbound_tx,
            enable_tx,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SubscriptionRegistry {
        &mut self.registry
    }

    pub fn is_live(&self, key: &SubscriptionKey) -> bool {
        self.registry.contains(key)
    }

    pub fn is_current(&self, key: &SubscriptionKey, generation: u64) -> bool {
        self.generations.get(key) == Some(&generation)
    }

    /// Invalidate every outstanding attempt for `key` and return the new
    /// generation.
    pub fn supersede(&mut self, key: &SubscriptionKey) -> u64 {
        self.next_generation += 1;
        self.generations.insert(key.clone(), self.next_generation);
        self.next_generation
    }

    /// Register `key` and give it a debouncer, if it has neither yet.
    pub fn ensure(&mut self, key: &SubscriptionKey) {
        self.registry.register(key);
        if !self.debouncers.contains_key(key) {
            self.debouncers.insert(
                key.clone(),
                EventDebouncer::with_periodic_sweep(self.debounce.clone()),
            );
        }
    }

    pub fn is_table_enabled(&self, table: &str) -> bool {
        self.enabled_tables.contains(table)
    }

    /// Fire-and-forget enablement; skipped for tables already enabled or
    /// with a call in flight.
    pub fn request_enable(&mut self, table: &str) {
        if self.is_table_enabled(table) || !self.enabling.insert(table.to_string()) {
            return;
        }

        let enabler = self.enabler.clone();
        let tx = self.enable_tx.clone();
        let table = table.to_string();
        debug!(table = %table, "enabling change feed");
        self.enable_tasks.spawn(async move {
            let result = enabler.enable_table(&table).await;
            let _ = tx.send(EnableOutcome { table, result });
        });
    }

    pub fn on_enable_outcome(&mut self, outcome: EnableOutcome) -> Result<()> {
        while self.enable_tasks.try_join_next().is_some() {}
        self.enabling.remove(&outcome.table);
        if outcome.result.is_ok() {
            self.enabled_tables.insert(outcome.table);
        }
        outcome.result
    }

    /// Issue a join for `key` under a fresh generation. On failure the
    /// generation of the failed attempt is returned alongside the error.
    pub async fn open(&mut self, key: &SubscriptionKey) -> std::result::Result<u64, (u64, RealtimeError)> {
        let generation = self.supersede(key);
        let request = ChannelRequest {
            name: key.to_string(),
            bindings: vec![ChangeBinding::for_key(key, &self.schema)],
        };
        let sink = ChannelSink::new(key.clone(), generation, self.inbound_tx.clone());

        match self.backend.subscribe(request, sink).await {
            Ok(handle) => {
                debug!(key = %key, generation, topic = handle.topic(), "join issued");
                self.registry.update_status(key, false, Some(handle));
                Ok(generation)
            }
            Err(e) => Err((generation, e)),
        }
    }

    /// Remove the key's current channel from the backend, keeping the key.
    pub async fn close_channel(&mut self, key: &SubscriptionKey) -> bool {
        let Some(handle) = self.registry.take_channel(key) else {
            return false;
        };
        if let Err(e) = self.backend.remove_channel(&handle).await {
            warn!(key = %key, error = %e, "failed to remove channel");
        }
        true
    }

    /// Forget `key` entirely: close its channel and dispose its debouncer.
    pub async fn teardown(&mut self, key: &SubscriptionKey) {
        self.registry.unregister(key, self.backend.as_ref()).await;
        if let Some(mut debouncer) = self.debouncers.remove(key) {
            debouncer.dispose();
        }
        self.generations.remove(key);
    }

    pub fn should_deliver(&self, key: &SubscriptionKey, event: &ChangeEvent, now: Instant) -> bool {
        match self.debouncers.get(key) {
            Some(debouncer) => debouncer.should_process_event(&event.identity_token(), Some(now)),
            None => true,
        }
    }

    pub async fn cleanup_all(&mut self) -> usize {
        let closed = self.registry.cleanup_all(self.backend.as_ref()).await;
        for (_, mut debouncer) in self.debouncers.drain() {
            debouncer.dispose();
        }
        self.generations.clear();
        self.enable_tasks.abort_all();
        self.enabling.clear();
        closed
    }
}
