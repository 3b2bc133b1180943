//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use dispatch_realtime::prelude::*;
//! ```

pub use crate::hooks::{
    mount_subscription, LifecycleSignal, MissionUpdate, MissionUpdates, MissionUpdatesConfig,
    MountedSubscription, SubscriptionOptions, TableSubscriptionConfig, Visibility,
};
pub use crate::{
    ChangeEvent, ChangeKind, EventBus, EventFilter, InterpreterStatus, MemoryBackend,
    PhoenixBackend, PhoenixConfig, RealtimeConfig, RealtimeError, RealtimeEvent, RealtimeService,
    RealtimeSubscription, RowChange, RowFilter, SubscriptionKey, TableRow, Teardown,
};

pub use futures_util::StreamExt;
