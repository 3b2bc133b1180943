//! Mount-scoped bindings for UI layers.
//!
//! A component mounts a binding when it appears and unmounts it (or drops
//! it) when it goes away; the underlying subscriptions are shared through
//! the service's ref counting. Bindings own no timers of their own.

use crate::error::Result;
use crate::event::ChangeEvent;
use crate::key::{EventFilter, RowFilter};
use crate::service::RealtimeService;
use crate::subscription::RealtimeSubscription;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct TableSubscriptionConfig {
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
}

impl TableSubscriptionConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    pub fn with_event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub enabled: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A table subscription bound to a component's lifetime.
#[derive(Debug)]
pub struct MountedSubscription {
    subscription: Option<RealtimeSubscription>,
    connection: watch::Receiver<bool>,
}

impl MountedSubscription {
    /// `false` when mounted with `enabled: false`.
    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Debounced service-wide connectivity.
    pub fn is_connected(&self) -> bool {
        *self.connection.borrow()
    }

    pub fn connection(&self) -> watch::Receiver<bool> {
        self.connection.clone()
    }

    pub fn subscription(&self) -> Option<&RealtimeSubscription> {
        self.subscription.as_ref()
    }

    pub fn unmount(self) {}
}

/// Subscribe for as long as the returned binding lives. With
/// `enabled: false` nothing is subscribed, but connectivity is still
/// observable.
pub async fn mount_subscription<F>(
    service: &RealtimeService,
    config: TableSubscriptionConfig,
    callback: F,
    options: SubscriptionOptions,
) -> Result<MountedSubscription>
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    let subscription = if options.enabled {
        Some(
            service
                .subscribe_to_table(&config.table, config.event, config.filter, callback)
                .await?,
        )
    } else {
        None
    };

    Ok(MountedSubscription {
        subscription,
        connection: service.connection_status(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Host signals relayed to mounted bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Online,
    Offline,
    Visibility(Visibility),
}

impl LifecycleSignal {
    /// Signals after which local state may be stale and should be refetched.
    pub fn is_resume(&self) -> bool {
        matches!(
            self,
            LifecycleSignal::Online | LifecycleSignal::Visibility(Visibility::Visible)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MissionUpdate {
    Mission(ChangeEvent),
    Reservation(ChangeEvent),
    /// An interpreter profile row changed its `status`.
    ProfileStatus(ChangeEvent),
    /// The host came back online or became visible.
    Resumed(LifecycleSignal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionUpdatesConfig {
    pub missions_table: String,
    pub reservations_table: String,
    /// Limit the profile watch to one interpreter.
    pub interpreter_id: Option<String>,
}

impl Default for MissionUpdatesConfig {
    fn default() -> Self {
        Self {
            missions_table: "missions".to_string(),
            reservations_table: "reservations".to_string(),
            interpreter_id: None,
        }
    }
}

impl MissionUpdatesConfig {
    pub fn for_interpreter(mut self, interpreter_id: impl Into<String>) -> Self {
        self.interpreter_id = Some(interpreter_id.into());
        self
    }
}

fn status_changed(event: &ChangeEvent) -> bool {
    match event.field("status") {
        Some(status) => event.old_field("status") != Some(status),
        None => false,
    }
}

/// Missions, reservations and profile status changes, delivered through
/// one callback while mounted.
pub struct MissionUpdates {
    subscriptions: Vec<RealtimeSubscription>,
    lifecycle_task: Option<JoinHandle<()>>,
}

impl MissionUpdates {
    pub async fn mount<F>(
        service: &RealtimeService,
        config: MissionUpdatesConfig,
        mut lifecycle: broadcast::Receiver<LifecycleSignal>,
        on_update: F,
    ) -> Result<Self>
    where
        F: Fn(MissionUpdate) + Send + Sync + 'static,
    {
        let on_update = Arc::new(on_update);
        let mut subscriptions = Vec::with_capacity(3);

        let cb = on_update.clone();
        subscriptions.push(
            service
                .subscribe_to_table(&config.missions_table, EventFilter::All, None, move |e| {
                    cb(MissionUpdate::Mission(e.clone()))
                })
                .await?,
        );

        let cb = on_update.clone();
        subscriptions.push(
            service
                .subscribe_to_table(&config.reservations_table, EventFilter::All, None, move |e| {
                    cb(MissionUpdate::Reservation(e.clone()))
                })
                .await?,
        );

        let profile_filter = match config.interpreter_id.as_deref() {
            Some(id) => Some(RowFilter::eq("id", id)?),
            None => None,
        };
        let cb = on_update.clone();
        let profiles_table = service.config().profiles_table.clone();
        subscriptions.push(
            service
                .subscribe_to_table(&profiles_table, EventFilter::Update, profile_filter, move |e| {
                    if status_changed(e) {
                        cb(MissionUpdate::ProfileStatus(e.clone()))
                    }
                })
                .await?,
        );

        let cb = on_update;
        let lifecycle_task = tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(signal) if signal.is_resume() => cb(MissionUpdate::Resumed(signal)),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "lifecycle signals lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            subscriptions,
            lifecycle_task: Some(lifecycle_task),
        })
    }

    pub fn subscriptions(&self) -> &[RealtimeSubscription] {
        &self.subscriptions
    }

    pub fn unmount(self) {}
}

impl Drop for MissionUpdates {
    fn drop(&mut self) {
        if let Some(task) = self.lifecycle_task.take() {
            task.abort();
        }
    }
}
