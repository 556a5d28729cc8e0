#![forbid(unsafe_code)]

//! Reactive state runtime for statewire.
//!
//! - [`Store`]: one isolated runtime instance. Owns the cell registry, the
//!   dependency-tracking stack, the observer bus, and the computed graph.
//! - [`StateCell`]: a named, typed, versioned value with its own listeners.
//! - [`Watcher`] / [`Reaction`]: automatic dependency tracking. Whatever an
//!   evaluation reads becomes its subscription set.
//! - [`Action`]: typed fire-and-forget channels, delivered locally and to the
//!   host through the [`Delegate`].
//! - Computed cells ([`Store::computed`]): targets re-derived from their
//!   declared sources on every qualifying change.
//!
//! # Architecture
//!
//! Everything is single-threaded. `Store` is an `Rc` handle; callbacks that
//! live inside the store hold a [`WeakStore`] so no reference cycle keeps a
//! dropped store alive. No internal `RefCell` borrow is held while a user
//! callback runs, so callbacks may read, write, subscribe, and unsubscribe
//! freely.
//!
//! # Invariants
//!
//! 1. A write equal to the current value is a no-op unless forced.
//! 2. Notification order per write: the cell's listeners, then every state
//!    observer, each in registration order.
//! 3. A nested tracked read is attributed to the innermost evaluation only,
//!    and the outer evaluation resumes afterwards, even on panic.
//! 4. A panicking callback is reported through the delegate and never stops
//!    delivery to the callbacks after it.
//! 5. A key is bound to one element type for the lifetime of its cell.

pub mod bus;
pub mod cell;
pub mod computed;
pub mod delegate;
pub mod error;
pub mod registry;
pub mod store;
pub mod watcher;

pub use bus::{
    Action, ActionCallback, ActionEnvelope, ObserverId, PulseOptions, StateCallback, StateChange,
};
pub use cell::{CellId, CellValue, ListenerId, StateCell};
pub use computed::{COMPUTED_SOURCE, DependencySnapshot};
pub use delegate::{
    Component, Delegate, HostCallback, InteractionKind, InteractionRecord, LogContext, LogRecord,
    RecordingDelegate, SubscriptionHandle, TracingDelegate,
};
pub use error::{BoxError, ComputeError, Result, StoreError};
pub use registry::{CellInfo, RegistrySnapshot};
pub use store::{ObserverCounts, Store, StoreConfig, WeakStore, WriteOptions};
pub use watcher::{DependencySet, Reaction, Watcher};
