use crate::backend::{NoopEnabler, PublicationEnabler, RealtimeBackend};
use crate::bus::EventBus;
use crate::config::RealtimeConfig;
use crate::engine::{ChangeCallback, Command, Engine, EngineInbox, Listener};
use crate::error::{RealtimeError, Result};
use crate::event::{ChangeEvent, RowChange, TableRow};
use crate::key::{EventFilter, RowFilter, SubscriptionKey};
use crate::registry::SubscriptionStatus;
use crate::subscription::RealtimeSubscription;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct RealtimeServiceBuilder {
    backend: Arc<dyn RealtimeBackend>,
    enabler: Arc<dyn PublicationEnabler>,
    config: RealtimeConfig,
    bus: Option<EventBus>,
}

impl RealtimeServiceBuilder {
    pub fn config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn publication_enabler<E: PublicationEnabler>(mut self, enabler: E) -> Self {
        self.enabler = Arc::new(enabler);
        self
    }

    /// Publish onto an existing bus instead of a private one.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<RealtimeService> {
        self.config.validate()?;

        let bus = self.bus.unwrap_or_default();
        let (raw_tx, raw_rx) = watch::channel(false);
        let (stable_tx, stable_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let (engine, inbox) = Engine::new(
            self.config.clone(),
            self.backend,
            self.enabler,
            bus.clone(),
            raw_tx,
            stable_tx,
            commands_rx,
        );

        Ok(RealtimeService {
            inner: Arc::new(ServiceInner {
                config: self.config,
                commands: commands_tx,
                pending: Mutex::new(Some((engine, inbox))),
                started: AtomicBool::new(false),
                raw_status: raw_rx,
                stable_status: stable_rx,
                bus,
                next_listener: AtomicU64::new(1),
            }),
        })
    }
}

struct ServiceInner {
    config: RealtimeConfig,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<(Engine, EngineInbox)>>,
    started: AtomicBool,
    raw_status: watch::Receiver<bool>,
    stable_status: watch::Receiver<bool>,
    bus: EventBus,
    next_listener: AtomicU64,
}

/// Entry point for realtime subscriptions.
///
/// Cheap to clone; every clone drives the same engine. Nothing runs until
/// [`init`](Self::init) is called.
///
/// ```no_run
/// use dispatch_realtime::prelude::*;
///
/// # async fn run() -> dispatch_realtime::Result<()> {
/// let service = RealtimeService::builder(MemoryBackend::auto_ack()).build()?;
/// let teardown = service.init();
///
/// let _missions = service
///     .subscribe_to_table("missions", EventFilter::All, None, |event| {
///         println!("{} on {}", event.kind.as_str(), event.table);
///     })
///     .await?;
///
/// teardown.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RealtimeService {
    inner: Arc<ServiceInner>,
}

impl RealtimeService {
    pub fn builder<B: RealtimeBackend>(backend: B) -> RealtimeServiceBuilder {
        RealtimeServiceBuilder {
            backend: Arc::new(backend),
            enabler: Arc::new(NoopEnabler),
            config: RealtimeConfig::default(),
            bus: None,
        }
    }

    pub fn new<B: RealtimeBackend>(backend: B, config: RealtimeConfig) -> Result<Self> {
        Self::builder(backend).config(config).build()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Start the engine. Must be called from within a tokio runtime.
    ///
    /// A second call is a no-op and returns an empty [`Teardown`].
    pub fn init(&self) -> Teardown {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some((engine, inbox)) = pending else {
            debug!("realtime service already initialized");
            return Teardown { inner: None };
        };

        let handle = tokio::spawn(engine.run(inbox));
        self.inner.started.store(true, Ordering::Release);

        Teardown {
            inner: Some((self.inner.commands.clone(), handle)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Listen for changes on `table`. Requests with the same table, event
    /// and filter share one backend channel.
    pub async fn subscribe_to_table<F>(
        &self,
        table: &str,
        event: EventFilter,
        filter: Option<RowFilter>,
        callback: F,
    ) -> Result<RealtimeSubscription>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::table(table, event, filter);
        self.acquire(key, Some(Arc::new(callback))).await
    }

    /// Typed variant of [`subscribe_to_table`](Self::subscribe_to_table).
    /// Rows that fail to decode are logged and skipped.
    pub async fn subscribe_to_rows<T, F>(
        &self,
        event: EventFilter,
        filter: Option<RowFilter>,
        callback: F,
    ) -> Result<RealtimeSubscription>
    where
        T: TableRow,
        F: Fn(RowChange<T>) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::table(T::TABLE, event, filter);
        let callback: ChangeCallback = Arc::new(move |change: &ChangeEvent| {
            match change.decode::<T>() {
                Ok(row) => callback(row),
                Err(e) => warn!(table = T::TABLE, error = %e, "failed to decode row change"),
            }
        });
        self.acquire(key, Some(callback)).await
    }

    /// Watch an interpreter's availability. Transitions are published on
    /// [`events`](Self::events) as `InterpreterStatusChanged`.
    pub async fn subscribe_to_interpreter_status(
        &self,
        interpreter_id: &str,
    ) -> Result<RealtimeSubscription> {
        let key = SubscriptionKey::entity_status(&self.inner.config.profiles_table, interpreter_id);
        self.acquire(key, None).await
    }

    /// Undebounced aggregate: `true` iff every subscription is connected.
    pub fn is_connected(&self) -> bool {
        *self.inner.raw_status.borrow()
    }

    /// Debounced aggregate connectivity.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.stable_status.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Reconnect every subscription with staggered offsets. Returns
    /// `false` if a previous sweep is still running.
    pub async fn reconnect_all(&self) -> Result<bool> {
        self.request(|reply| Command::ReconnectAll { reply }).await
    }

    /// Reconnect one subscription now, clearing retry and breaker state.
    /// Returns `false` for unknown keys.
    pub async fn force_reconnect(&self, key: &SubscriptionKey) -> Result<bool> {
        let key = key.clone();
        self.request(|reply| Command::ForceReconnect { key, reply })
            .await
    }

    pub async fn status(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionStatus>> {
        let key = key.clone();
        self.request(|reply| Command::Status { key, reply }).await
    }

    pub async fn statuses(&self) -> Result<Vec<(SubscriptionKey, SubscriptionStatus)>> {
        self.request(|reply| Command::Statuses { reply }).await
    }

    pub async fn active_count(&self) -> Result<usize> {
        Ok(self.counts().await?.0)
    }

    pub async fn total_count(&self) -> Result<usize> {
        Ok(self.counts().await?.1)
    }

    async fn counts(&self) -> Result<(usize, usize)> {
        self.request(|reply| Command::Counts { reply }).await
    }

    async fn acquire(
        &self,
        key: SubscriptionKey,
        callback: Option<ChangeCallback>,
    ) -> Result<RealtimeSubscription> {
        if !self.is_initialized() {
            return Err(RealtimeError::NotInitialized);
        }
        let listener_id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let listener = Listener {
            id: listener_id,
            active: active.clone(),
            callback,
        };

        // Armed before the acquire goes out: if this future is dropped while
        // waiting for the reply, the guard's drop queues the matching release.
        let subscription = RealtimeSubscription::new(
            key.clone(),
            listener_id,
            active,
            self.inner.commands.clone(),
        );
        self.request(|reply| Command::Acquire {
            key,
            listener,
            reply,
        })
        .await?;

        Ok(subscription)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        if !self.is_initialized() {
            return Err(RealtimeError::NotInitialized);
        }
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(build(reply))
            .map_err(|_| RealtimeError::ServiceStopped)?;
        response.await.map_err(|_| RealtimeError::ServiceStopped)
    }
}

/// Returned by [`RealtimeService::init`]. [`close`](Self::close) stops
/// every timer and closes every channel. Dropping it without closing
/// leaves the engine running.
#[must_use = "the engine keeps running until the teardown is closed"]
pub struct Teardown {
    inner: Option<(mpsc::UnboundedSender<Command>, JoinHandle<()>)>,
}

impl Teardown {
    /// `true` for the teardown returned by a repeated `init`.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub async fn close(self) {
        let Some((commands, handle)) = self.inner else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = handle.await {
            warn!(error = %e, "realtime engine task failed");
        }
    }
}
