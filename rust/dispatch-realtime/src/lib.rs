//! # dispatch-realtime
//!
//! Realtime subscription engine for the interpreter dispatch dashboard.
//!
//! Components subscribe to row changes on database tables through a single
//! [`RealtimeService`]. The service deduplicates identical subscriptions
//! onto one backend channel, suppresses repeated change deliveries,
//! retries failed channels with exponential backoff behind a shared
//! circuit breaker, and publishes aggregate connection health and
//! interpreter status transitions on an [`EventBus`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use dispatch_realtime::prelude::*;
//!
//! let backend = PhoenixBackend::connect(PhoenixConfig::new(url, api_key))?;
//! let service = RealtimeService::new(backend, RealtimeConfig::default())?;
//! let teardown = service.init();
//!
//! let _missions = service
//!     .subscribe_to_table("missions", EventFilter::All, None, |event| {
//!         println!("{:?}", event.record);
//!     })
//!     .await?;
//!
//! let mut events = service.events().subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! teardown.close().await;
//! ```
//!
//! ## Backends
//!
//! - [`PhoenixBackend`] - the hosted realtime WebSocket protocol
//! - [`MemoryBackend`] - scriptable in-process backend for tests

pub mod backend;
pub mod breaker;
mod bus;
mod config;
mod debouncer;
mod engine;
mod error;
mod event;
pub mod hooks;
mod key;
mod manager;
pub mod monitor;
pub mod prelude;
mod registry;
mod service;
mod subscription;
pub mod telemetry;

pub use backend::{
    ChangeBinding, ChannelHandle, ChannelRequest, ChannelSink, ChannelStatus,
    HttpPublicationEnabler, MemoryBackend, NoopEnabler, PhoenixBackend, PhoenixConfig,
    PublicationEnabler, RealtimeBackend,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{EventBus, InterpreterStatus, RealtimeEvent};
pub use config::{BreakerConfig, DebounceConfig, HealthConfig, RealtimeConfig, RetryConfig};
pub use debouncer::EventDebouncer;
pub use error::{RealtimeError, Result};
pub use event::{ChangeEvent, ChangeKind, RowChange, TableRow};
pub use key::{EventFilter, FilterOp, RowFilter, SubscriptionKey};
pub use monitor::{ConnectionMonitor, LinkState};
pub use registry::{SubscriptionRegistry, SubscriptionStatus};
pub use service::{RealtimeService, RealtimeServiceBuilder, Teardown};
pub use subscription::RealtimeSubscription;

pub use serde_json::Value;
