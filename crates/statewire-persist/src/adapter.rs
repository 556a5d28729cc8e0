#![forbid(unsafe_code)]

//! Debounced persistence of selected cells.
//!
//! A [`Persistence`] adapter watches the store's "state changed" class. A
//! change to a tracked key (re)arms the debounce; once the window elapses,
//! [`tick`](Persistence::tick) writes every tracked key that currently exists
//! into one [`Envelope`] under the configured storage key.
//!
//! # Failure Modes
//!
//! - **Storage or codec failure**: reported through the store's delegate as a
//!   persistence error. The operation becomes a no-op; the in-memory state is
//!   untouched and the next change re-arms the debounce.
//! - **Unreadable or unencodable tracked key**: reported as an error and
//!   left out of the envelope; the other keys are still saved.
//! - **Undecodable stored value**: that key is skipped on restore and logged;
//!   the other keys are still applied.
//!
//! [`Store::clear`] drops every observer, including the adapter's. Create a
//! new adapter after clearing if changes should keep arming saves.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};
use statewire_core::{CellValue, Component, LogContext, ObserverId, Store, WriteOptions};
use web_time::Duration;

use crate::debounce::{Clock, Debouncer, SystemClock};
use crate::encode::{Encoded, Persistable};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::storage::Storage;

/// Source id attached to every write performed by a restore.
pub const PERSISTENCE_SOURCE: &str = "persistence";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistConfig {
    /// Storage key the envelope is written under.
    pub storage_key: String,
    /// Quiet period after the last tracked change before saving.
    pub debounce: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            storage_key: "statewire".to_owned(),
            debounce: Duration::from_millis(500),
        }
    }
}

impl PersistConfig {
    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

type EncodeFn = Box<dyn Fn(&Store) -> Result<Option<Encoded>>>;
type ApplyFn = Box<dyn Fn(&Store, &Value) -> Result<bool>>;

struct TrackedKey {
    encode: EncodeFn,
    apply: ApplyFn,
}

struct Shared<S, C: Clock> {
    storage: S,
    config: PersistConfig,
    tracked: RefCell<BTreeMap<String, Rc<TrackedKey>>>,
    debouncer: RefCell<Debouncer<C>>,
}

/// Adapter that saves tracked cells to a [`Storage`] and restores them.
pub struct Persistence<S: Storage + 'static, C: Clock + 'static = SystemClock> {
    store: Store,
    shared: Rc<Shared<S, C>>,
    observer: ObserverId,
}

impl<S: Storage + 'static> Persistence<S, SystemClock> {
    pub fn new(store: &Store, storage: S, config: PersistConfig) -> Self {
        Self::with_clock(store, storage, config, SystemClock)
    }
}

impl<S: Storage + 'static, C: Clock + 'static> Persistence<S, C> {
    pub fn with_clock(store: &Store, storage: S, config: PersistConfig, clock: C) -> Self {
        let shared = Rc::new(Shared {
            debouncer: RefCell::new(Debouncer::with_clock(config.debounce, clock)),
            storage,
            config,
            tracked: RefCell::new(BTreeMap::new()),
        });

        let weak = Rc::downgrade(&shared);
        let observer = store.subscribe_state(move |change| {
            if change.source_module_id() == Some(PERSISTENCE_SOURCE) {
                return;
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.tracked.borrow().contains_key(change.key()) {
                shared.debouncer.borrow_mut().schedule();
            }
        });

        Self {
            store: store.clone(),
            shared,
            observer,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PersistConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.shared.storage
    }

    /// Persist `key` as a `T`. Re-tracking a key replaces its codec.
    pub fn track<T: CellValue + Persistable>(&self, key: &str) {
        let read_key = key.to_owned();
        let write_key = key.to_owned();
        let entry = TrackedKey {
            encode: Box::new(move |store: &Store| {
                let value = store.untracked(|| store.read::<T>(&read_key))?;
                Ok(value.map(|value| value.encode()))
            }),
            apply: Box::new(move |store: &Store, json: &Value| {
                let Some(value) = T::decode(json) else {
                    return Ok(false);
                };
                store.write(
                    &write_key,
                    value,
                    WriteOptions::from_source(PERSISTENCE_SOURCE),
                )?;
                Ok(true)
            }),
        };
        self.shared
            .tracked
            .borrow_mut()
            .insert(key.to_owned(), Rc::new(entry));
        tracing::debug!(key, type_name = std::any::type_name::<T>(), "persistence tracking key");
    }

    pub fn untrack(&self, key: &str) -> bool {
        self.shared.tracked.borrow_mut().remove(key).is_some()
    }

    /// Tracked keys, sorted.
    #[must_use]
    pub fn tracked_keys(&self) -> Vec<String> {
        self.shared.tracked.borrow().keys().cloned().collect()
    }

    /// Whether a debounced save is waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.debouncer.borrow().is_pending()
    }

    /// Time left before the pending save fires.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.shared.debouncer.borrow().remaining()
    }

    /// Drive the debounce. Returns `true` when a save ran and succeeded.
    pub fn tick(&self) -> bool {
        let fire = self.shared.debouncer.borrow_mut().poll();
        fire && self.save_now()
    }

    /// Save immediately if a save is pending.
    pub fn flush(&self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.save_now()
    }

    /// Save now, reporting failures through the delegate.
    pub fn save_now(&self) -> bool {
        match self.try_save() {
            Ok(()) => true,
            Err(err) => {
                self.report(None, &format!("save failed: {err}"), true);
                false
            }
        }
    }

    /// Write every tracked key that exists into one envelope.
    ///
    /// A key that cannot be read as its tracked type, or cannot be encoded,
    /// is reported through the delegate and left out; the other keys are
    /// still written. Cancels any pending debounce, whether or not the write
    /// succeeds.
    pub fn try_save(&self) -> Result<()> {
        self.shared.debouncer.borrow_mut().cancel();
        let entries: Vec<(String, Rc<TrackedKey>)> = self
            .shared
            .tracked
            .borrow()
            .iter()
            .map(|(key, entry)| (key.clone(), Rc::clone(entry)))
            .collect();
        let mut data = Map::new();
        for (key, entry) in entries {
            let encoded = match (entry.encode)(&self.store) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => continue,
                Err(err) => {
                    self.report(Some(&key), &format!("save skipped: {err}"), true);
                    continue;
                }
            };
            match &encoded {
                Encoded::Failed(message) => {
                    self.report(
                        Some(&key),
                        &format!("save skipped: encoding failed: {message}"),
                        true,
                    );
                    continue;
                }
                Encoded::Textual(_) => {
                    self.report(Some(&key), "serialization fallback: stored textual form", false);
                }
                Encoded::Primitive(_) | Encoded::Structured(_) => {}
            }
            data.insert(key, encoded.into_json());
        }
        let count = data.len();
        let bytes = Envelope::new(data).to_bytes()?;
        self.shared
            .storage
            .write(&self.shared.config.storage_key, &bytes)?;
        tracing::debug!(
            storage_key = %self.shared.config.storage_key,
            keys = count,
            bytes = bytes.len(),
            "state saved"
        );
        Ok(())
    }

    /// Restore tracked keys, reporting failures through the delegate.
    /// Returns how many keys were applied.
    pub fn restore(&self) -> usize {
        match self.try_restore() {
            Ok(applied) => applied,
            Err(err) => {
                self.report(None, &format!("restore failed: {err}"), true);
                0
            }
        }
    }

    /// Apply the stored envelope to the store.
    ///
    /// Keys in the envelope that are not tracked are ignored. A tracked key
    /// whose value does not decode, or whose cell holds another type, is
    /// logged and skipped. Restored writes carry the source
    /// [`PERSISTENCE_SOURCE`] and do not arm the debounce.
    pub fn try_restore(&self) -> Result<usize> {
        let Some(bytes) = self.shared.storage.read(&self.shared.config.storage_key)? else {
            return Ok(0);
        };
        let envelope = Envelope::from_bytes(&bytes)?;

        // Applied outside the `tracked` borrow: restored writes notify
        // observers, which may track or untrack keys.
        let entries: Vec<(String, Rc<TrackedKey>)> = self
            .shared
            .tracked
            .borrow()
            .iter()
            .filter(|(key, _)| envelope.data.contains_key(key.as_str()))
            .map(|(key, entry)| (key.clone(), Rc::clone(entry)))
            .collect();

        let mut applied = 0;
        for (key, entry) in entries {
            let Some(json) = envelope.get(&key) else {
                continue;
            };
            match (entry.apply)(&self.store, json) {
                Ok(true) => applied += 1,
                Ok(false) => {
                    self.report(Some(&key), "stored value does not decode; skipped", false);
                }
                Err(err) => {
                    self.report(Some(&key), &format!("restore skipped: {err}"), true);
                }
            }
        }
        tracing::debug!(
            storage_key = %self.shared.config.storage_key,
            applied,
            saved_at = %envelope.timestamp,
            "state restored"
        );
        Ok(applied)
    }

    /// Remove the stored envelope, reporting failures through the delegate.
    pub fn clear_storage(&self) -> bool {
        self.shared.debouncer.borrow_mut().cancel();
        match self.shared.storage.remove(&self.shared.config.storage_key) {
            Ok(()) => true,
            Err(err) => {
                self.report(None, &format!("clear failed: {err}"), true);
                false
            }
        }
    }

    fn report(&self, key: Option<&str>, message: &str, is_error: bool) {
        let context = LogContext::new(Component::Persistence);
        let context = match key {
            Some(key) => context.with_key(key),
            None => context,
        };
        self.store.delegate().log(message, &context, is_error);
    }
}

impl<S: Storage + 'static, C: Clock + 'static> Drop for Persistence<S, C> {
    fn drop(&mut self) {
        self.store.unsubscribe_state(self.observer);
    }
}

impl<S: Storage + 'static, C: Clock + 'static> fmt::Debug for Persistence<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.shared.config)
            .field("tracked", &self.tracked_keys())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
