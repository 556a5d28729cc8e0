#![forbid(unsafe_code)]

//! Persistence for statewire stores.
//!
//! A [`Persistence`] adapter saves selected cells as one JSON [`Envelope`]
//! after a quiet period, and restores them on demand.
//!
//! - [`Persistable`]: the opt-in serializer capability for cell values.
//! - [`Storage`]: where envelopes live ([`MemoryStorage`], [`FileStorage`]).
//! - [`Debouncer`] / [`Clock`]: trailing-edge scheduling; [`ManualClock`]
//!   makes it deterministic in tests.
//!
//! # Example
//!
//! ```
//! use statewire_core::{Store, WriteOptions};
//! use statewire_persist::{MemoryStorage, PersistConfig, Persistence};
//!
//! let store = Store::new();
//! let storage = MemoryStorage::new();
//! let persistence = Persistence::new(&store, storage.clone(), PersistConfig::default());
//! persistence.track::<i64>("counter");
//!
//! store.write("counter", 5_i64, WriteOptions::default()).unwrap();
//! assert!(persistence.save_now());
//!
//! store.clear();
//! let persistence = Persistence::new(&store, storage, PersistConfig::default());
//! persistence.track::<i64>("counter");
//! assert_eq!(persistence.restore(), 1);
//! assert_eq!(store.read::<i64>("counter").unwrap(), Some(5));
//! ```
//!
//! # Failure Modes
//!
//! Every failure degrades to "nothing saved" or "nothing restored" and is
//! reported through the store's delegate. The `try_*` variants return the
//! [`PersistError`] instead.

pub mod adapter;
pub mod debounce;
pub mod encode;
pub mod envelope;
pub mod error;
pub mod storage;

pub use adapter::{PERSISTENCE_SOURCE, PersistConfig, Persistence};
pub use debounce::{Clock, Debouncer, ManualClock, SystemClock};
pub use encode::{Encoded, Persistable, decode_serde, encode_serde};
pub use envelope::{ENVELOPE_VERSION, Envelope};
pub use error::{PersistError, Result};
pub use storage::{FileStorage, MemoryStorage, Storage};
