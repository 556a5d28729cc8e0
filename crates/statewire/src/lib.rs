#![forbid(unsafe_code)]

//! statewire public facade crate.
//!
//! Re-exports the reactive runtime and, with the `persist` feature (on by
//! default), the persistence adapter.

pub use statewire_core as core;
#[cfg(feature = "persist")]
pub use statewire_persist as persist;

pub use statewire_core::{
    Action, ActionEnvelope, Component, Delegate, ObserverId, PulseOptions, Reaction,
    RecordingDelegate, Result, StateCell, StateChange, Store, StoreConfig, StoreError,
    TracingDelegate, Watcher, WeakStore, WriteOptions,
};

pub mod prelude {
    pub use statewire_core::{
        Action, ActionEnvelope, CellValue, DependencySnapshot, PulseOptions, StateCell,
        StateChange, Store, StoreConfig, WriteOptions,
    };
    #[cfg(feature = "persist")]
    pub use statewire_persist::{MemoryStorage, Persistable, PersistConfig, Persistence};
}
