//! The engine task.
//!
//! All subscription state is owned by a single task. The public handles
//! talk to it through [`Command`]s; backends talk to it through channel
//! sinks; timers (retries, join timeouts, staggered reconnects, the health
//! tick and status debouncing) live in one `DelayQueue` and are never
//! cancelled, only recognised as stale when they fire.

use crate::backend::{ChannelMessage, ChannelPayload, PublicationEnabler, RealtimeBackend};
use crate::bus::{EventBus, InterpreterStatus, RealtimeEvent};
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::event::ChangeEvent;
use crate::key::SubscriptionKey;
use crate::manager::{EnableOutcome, SubscriptionManager};
use crate::monitor::{ConnectionMonitor, FailureDecision, HealthAction, LinkState};
use crate::registry::SubscriptionStatus;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, trace, warn};

pub(crate) type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

pub(crate) struct Listener {
    pub id: u64,
    pub active: Arc<AtomicBool>,
    pub callback: Option<ChangeCallback>,
}

impl Listener {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) enum Command {
    Acquire {
        key: SubscriptionKey,
        listener: Listener,
        reply: oneshot::Sender<()>,
    },
    Release {
        key: SubscriptionKey,
        listener_id: u64,
    },
    ReconnectAll {
        reply: oneshot::Sender<bool>,
    },
    ForceReconnect {
        key: SubscriptionKey,
        reply: oneshot::Sender<bool>,
    },
    Status {
        key: SubscriptionKey,
        reply: oneshot::Sender<Option<SubscriptionStatus>>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<(SubscriptionKey, SubscriptionStatus)>>,
    },
    Counts {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Timer {
    Retry { key: SubscriptionKey, generation: u64 },
    ConnectTimeout { key: SubscriptionKey, generation: u64 },
    SweepReconnect { key: SubscriptionKey, sweep: u64 },
    Health,
    PublishStatus { seq: u64 },
}

struct Sweep {
    id: u64,
    remaining: usize,
}

pub(crate) struct EngineInbox {
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    enabled: mpsc::UnboundedReceiver<EnableOutcome>,
}

pub(crate) struct Engine {
    config: RealtimeConfig,
    manager: SubscriptionManager,
    monitor: ConnectionMonitor,
    bus: EventBus,
    listeners: HashMap<SubscriptionKey, Vec<Listener>>,
    timers: DelayQueue<Timer>,
    raw_status: watch::Sender<bool>,
    stable_status: watch::Sender<bool>,
    status_seq: u64,
    sweep: Option<Sweep>,
    next_sweep: u64,
}

impl Engine {
    pub fn new(
        config: RealtimeConfig,
        backend: Arc<dyn RealtimeBackend>,
        enabler: Arc<dyn PublicationEnabler>,
        bus: EventBus,
        raw_status: watch::Sender<bool>,
        stable_status: watch::Sender<bool>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, EngineInbox) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (enable_tx, enabled) = mpsc::unbounded_channel();

        let manager = SubscriptionManager::new(&config, backend, enabler, inbound_tx, enable_tx);
        let monitor = ConnectionMonitor::new(
            config.retry.clone(),
            config.breaker.clone(),
            config.health.clone(),
        );

        let engine = Self {
            config,
            manager,
            monitor,
            bus,
            listeners: HashMap::new(),
            timers: DelayQueue::new(),
            raw_status,
            stable_status,
            status_seq: 0,
            sweep: None,
            next_sweep: 0,
        };
        let inbox = EngineInbox {
            commands,
            inbound,
            enabled,
        };
        (engine, inbox)
    }

    pub async fn run(mut self, inbox: EngineInbox) {
        let EngineInbox {
            mut commands,
            mut inbound,
            mut enabled,
        } = inbox;

        self.monitor.record_activity(Instant::now());
        self.timers
            .insert(Timer::Health, self.config.health.heartbeat_interval);
        info!("realtime engine started");

        loop {
            tokio::select! {
                biased;

                Some(msg) = inbound.recv() => {
                    self.on_channel_message(msg).await;
                }
                Some(outcome) = enabled.recv() => {
                    self.on_enable_outcome(outcome);
                }
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_timer(expired.into_inner()).await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.on_command(cmd).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Acquire {
                key,
                listener,
                reply,
            } => {
                let first = !self.listeners.contains_key(&key);
                self.listeners
                    .entry(key.clone())
                    .or_default()
                    .push(listener);

                if first {
                    info!(key = %key, "opening subscription");
                    self.manager.ensure(&key);
                    self.monitor.track(&key);
                    self.connect(&key).await;
                    self.refresh_status();
                } else {
                    debug!(key = %key, "sharing existing subscription");
                }
                let _ = reply.send(());
            }
            Command::Release { key, listener_id } => {
                let Some(listeners) = self.listeners.get_mut(&key) else {
                    return;
                };
                listeners.retain(|l| l.id != listener_id);
                if listeners.is_empty() {
                    self.listeners.remove(&key);
                    self.manager.teardown(&key).await;
                    self.monitor.forget(&key);
                    info!(key = %key, "subscription closed");
                    self.refresh_status();
                }
            }
            Command::ReconnectAll { reply } => {
                let started = self.reconnect_all();
                let _ = reply.send(started);
            }
            Command::ForceReconnect { key, reply } => {
                if !self.manager.is_live(&key) {
                    let _ = reply.send(false);
                    return;
                }
                info!(key = %key, "forced reconnect");
                self.monitor.breaker_mut().reset();
                self.reconnect_key(&key).await;
                let _ = reply.send(true);
            }
            Command::Status { key, reply } => {
                let _ = reply.send(self.manager.registry().get_status(&key).cloned());
            }
            Command::Statuses { reply } => {
                let _ = reply.send(self.manager.registry().get_all_statuses());
            }
            Command::Counts { reply } => {
                let registry = self.manager.registry();
                let _ = reply.send((registry.get_active_count(), registry.get_total_count()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_channel_message(&mut self, msg: ChannelMessage) {
        let ChannelMessage {
            key,
            generation,
            payload,
        } = msg;

        if !self.manager.is_live(&key) {
            trace!(key = %key, "message for closed subscription dropped");
            return;
        }

        match payload {
            ChannelPayload::Change(event) => self.on_change(&key, event),
            ChannelPayload::Status(status) => {
                if !self.manager.is_current(&key, generation) {
                    debug!(key = %key, generation, status = %status, "status from superseded channel ignored");
                    return;
                }
                match status.failure(&key) {
                    None => self.on_subscribed(&key),
                    Some(err) => self.on_channel_failure(&key, generation, err).await,
                }
            }
        }
    }

    fn on_enable_outcome(&mut self, outcome: EnableOutcome) {
        let table = outcome.table.clone();
        if let Err(e) = self.manager.on_enable_outcome(outcome) {
            warn!(table = %table, error = %e, "change feed enablement failed");
            self.monitor.breaker_mut().record_failure(Instant::now());
        }
    }

    fn on_subscribed(&mut self, key: &SubscriptionKey) {
        if self.monitor.state(key) == Some(LinkState::Connected) {
            return;
        }

        self.manager.registry_mut().update_status(key, true, None);
        let recovered = self.monitor.on_connected(key);
        info!(key = %key, "subscription connected");

        if recovered {
            let exhausted = self.monitor.exhausted_keys();
            if !exhausted.is_empty() {
                info!(count = exhausted.len(), "reviving exhausted subscriptions");
                self.start_sweep(exhausted, "recovery");
            }
        }
        self.refresh_status();
    }

    /// A join attempt failed or an established channel dropped. Only the
    /// former counts against the breaker: one socket drop closes every
    /// channel at once and must not trip it on its own.
    async fn on_channel_failure(&mut self, key: &SubscriptionKey, generation: u64, reason: RealtimeError) {
        if !self.manager.is_current(key, generation) {
            return;
        }

        if self.monitor.state(key) != Some(LinkState::Connected) {
            self.monitor.breaker_mut().record_failure(Instant::now());
        }
        self.manager.close_channel(key).await;
        let retry_generation = self.manager.supersede(key);

        let used = self
            .manager
            .registry()
            .get_status(key)
            .map(|s| s.retry_count)
            .unwrap_or(0);

        match self.monitor.on_failure(key, used) {
            FailureDecision::Retry { attempt, delay } => {
                self.manager.registry_mut().record_retry(key);
                warn!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "subscription failed, retrying"
                );
                self.timers.insert(
                    Timer::Retry {
                        key: key.clone(),
                        generation: retry_generation,
                    },
                    delay,
                );
            }
            FailureDecision::Exhausted { attempts } => {
                error!(key = %key, attempts, reason = %reason, "subscription gave up after exhausting retries");
                self.bus.publish(RealtimeEvent::SubscriptionExhausted {
                    key: key.clone(),
                    attempts,
                });
            }
        }
        self.refresh_status();
    }

    fn on_change(&mut self, key: &SubscriptionKey, event: ChangeEvent) {
        let now = Instant::now();
        if self.monitor.record_activity(now) {
            info!("change received, idle reconnect loop stopped");
        }

        if !key.event().matches(event.kind) {
            trace!(key = %key, kind = event.kind.as_str(), "change outside subscribed events");
            return;
        }
        if !self.manager.should_deliver(key, &event, now) {
            trace!(key = %key, "duplicate change suppressed");
            return;
        }

        match key {
            SubscriptionKey::EntityStatus { entity_id, .. } => {
                self.publish_entity_status(key, entity_id, &event)
            }
            SubscriptionKey::Table { .. } => self.dispatch(key, &event),
        }
    }

    fn dispatch(&mut self, key: &SubscriptionKey, event: &ChangeEvent) {
        let Some(listeners) = self.listeners.get(key) else {
            return;
        };

        let mut failures = 0;
        for listener in listeners.iter().filter(|l| l.is_active()) {
            let Some(callback) = listener.callback.as_ref() else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                failures += 1;
            }
        }

        let budget = self.config.callback_error_budget;
        for _ in 0..failures {
            let count = self.manager.registry_mut().record_callback_failure(key);
            warn!(key = %key, failures = count, "subscription callback panicked");
            if count == budget.saturating_add(1) {
                error!(key = %key, budget, "subscription callback error budget exceeded");
            }
        }
    }

    fn publish_entity_status(&mut self, key: &SubscriptionKey, entity_id: &str, event: &ChangeEvent) {
        let watched = self
            .listeners
            .get(key)
            .is_some_and(|ls| ls.iter().any(Listener::is_active));
        if !watched {
            return;
        }

        let Some(status) = event.field("status").and_then(InterpreterStatus::from_value) else {
            return;
        };
        let previous = event.old_field("status").and_then(InterpreterStatus::from_value);
        if previous == Some(status) {
            return;
        }

        debug!(interpreter_id = entity_id, status = %status, "interpreter status changed");
        self.bus.publish(RealtimeEvent::InterpreterStatusChanged {
            interpreter_id: entity_id.to_string(),
            status,
        });
    }

    /// Issue a join for `key`, or defer it while the breaker is open.
    async fn connect(&mut self, key: &SubscriptionKey) {
        let now = Instant::now();
        if !self.monitor.breaker().allow(now) {
            let wait = self
                .monitor
                .breaker()
                .remaining(now)
                .unwrap_or(self.config.breaker.reset_timeout);
            let generation = self.manager.supersede(key);
            debug!(key = %key, wait_ms = wait.as_millis() as u64, "circuit breaker open, connect deferred");
            self.timers.insert(
                Timer::Retry {
                    key: key.clone(),
                    generation,
                },
                wait,
            );
            return;
        }

        self.manager.request_enable(key.table_name());
        self.monitor.on_connecting(key);

        match self.manager.open(key).await {
            Ok(generation) => {
                self.timers.insert(
                    Timer::ConnectTimeout {
                        key: key.clone(),
                        generation,
                    },
                    self.config.connection_timeout,
                );
            }
            Err((generation, e)) => {
                warn!(key = %key, error = %e, "subscribe call failed");
                self.on_channel_failure(key, generation, e).await;
            }
        }
    }

    async fn reconnect_key(&mut self, key: &SubscriptionKey) {
        self.manager.close_channel(key).await;
        self.manager.registry_mut().reset_retries(key);
        self.monitor.on_manual_reconnect(key);
        self.connect(key).await;
        self.refresh_status();
    }

    fn reconnect_all(&mut self) -> bool {
        if self.sweep.is_some() {
            info!("reconnect already in progress");
            return false;
        }
        self.monitor.breaker_mut().reset();
        let keys = self.manager.registry().keys();
        self.start_sweep(keys, "manual")
    }

    fn start_sweep(&mut self, keys: Vec<SubscriptionKey>, reason: &'static str) -> bool {
        if self.sweep.is_some() {
            debug!(reason, "sweep skipped, another is in progress");
            return false;
        }
        if keys.is_empty() {
            return true;
        }

        self.next_sweep += 1;
        let id = self.next_sweep;
        let count = keys.len();
        for (index, key) in keys.into_iter().enumerate() {
            let delay = self.monitor.retry_config().stagger_delay(index);
            self.timers
                .insert(Timer::SweepReconnect { key, sweep: id }, delay);
        }
        self.sweep = Some(Sweep {
            id,
            remaining: count,
        });
        info!(count, reason, "staggered reconnect started");
        true
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Retry { key, generation } => {
                if self.manager.is_current(&key, generation) {
                    self.connect(&key).await;
                    self.refresh_status();
                }
            }
            Timer::ConnectTimeout { key, generation } => {
                if self.manager.is_current(&key, generation)
                    && self.monitor.state(&key) != Some(LinkState::Connected)
                {
                    let err = RealtimeError::ConnectionFailed(format!("join of {} timed out", key));
                    self.on_channel_failure(&key, generation, err).await;
                }
            }
            Timer::SweepReconnect { key, sweep } => {
                if let Some(active) = self.sweep.as_mut() {
                    if active.id == sweep {
                        active.remaining -= 1;
                        if active.remaining == 0 {
                            self.sweep = None;
                            debug!("staggered reconnect complete");
                        }
                    }
                }
                if self.manager.is_live(&key) {
                    self.reconnect_key(&key).await;
                }
            }
            Timer::Health => {
                self.timers
                    .insert(Timer::Health, self.config.health.heartbeat_interval);
                match self.monitor.health_tick(Instant::now()) {
                    HealthAction::Nothing => {}
                    HealthAction::StaleDetected => {
                        warn!(
                            timeout_ms = self.config.health.event_timeout.as_millis() as u64,
                            "no change events received, starting idle reconnect loop"
                        );
                    }
                    HealthAction::Reconnect => {
                        let keys = self.manager.registry().keys();
                        self.start_sweep(keys, "idle");
                    }
                }
            }
            Timer::PublishStatus { seq } => {
                if seq != self.status_seq {
                    return;
                }
                let current = *self.raw_status.borrow();
                if *self.stable_status.borrow() == current {
                    return;
                }
                self.stable_status.send_replace(current);
                self.bus
                    .publish(RealtimeEvent::ConnectionStatusChanged { connected: current });
                if current {
                    info!("realtime connection established");
                } else {
                    warn!("realtime connection lost");
                }
            }
        }
    }

    /// Push the raw aggregate and arm the debounced publication.
    fn refresh_status(&mut self) {
        let connected = self.monitor.aggregate_connected();
        if *self.raw_status.borrow() == connected {
            return;
        }
        self.raw_status.send_replace(connected);
        self.status_seq += 1;
        self.timers.insert(
            Timer::PublishStatus {
                seq: self.status_seq,
            },
            self.config.status_debounce,
        );
    }

    async fn shutdown(&mut self) {
        self.timers.clear();
        self.sweep = None;
        for listener in self.listeners.values().flatten() {
            listener.active.store(false, Ordering::Release);
        }
        self.listeners.clear();

        let closed = self.manager.cleanup_all().await;
        self.monitor.clear();
        self.raw_status.send_replace(false);
        self.stable_status.send_replace(false);
        info!(closed, "realtime engine stopped");
    }
}
