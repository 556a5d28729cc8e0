#![forbid(unsafe_code)]

//! Derived cells kept consistent with their sources.
//!
//! A registration subscribes to the "state changed" class filtered to its
//! declared dependencies. Each qualifying change gathers a
//! [`DependencySnapshot`], runs the compute function, and writes the result
//! through the ordinary [`Store::write`] path with the source id
//! [`COMPUTED_SOURCE`].
//!
//! # Invariants
//!
//! 1. A result equal to the previous result is not written (redundant-write
//!    suppression). Stable fixed points therefore terminate.
//! 2. A failing or panicking compute leaves the target at its last written
//!    value. Failures are reported through the delegate and never retried.
//! 3. Re-registering a target replaces the prior registration wholesale.
//! 4. Unregistering detaches the observer and leaves the target value as is.
//!
//! # Failure Modes
//!
//! - **Cyclic registrations**: A computed from B computed from A is not
//!    detected. Unless the values settle, the cascade recurses until the
//!    stack overflows. Callers must keep the dependency graph acyclic.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use ahash::AHashMap;

use crate::bus::ObserverId;
use crate::cell::CellValue;
use crate::delegate::Component;
use crate::error::{BoxError, ComputeError, Result, StoreError, panic_message};
use crate::store::{Store, WriteOptions};

/// Source id attached to every write performed by a computed registration.
pub const COMPUTED_SOURCE: &str = "computed";

/// Values of a registration's dependencies at recompute time.
///
/// Absent keys are present in the snapshot as an explicit absent marker, so
/// `compute` can tell "not created yet" from "wrong key".
pub struct DependencySnapshot {
    values: BTreeMap<String, Option<(Rc<dyn Any>, &'static str)>>,
}

impl DependencySnapshot {
    fn gather(store: &Store, dependencies: &BTreeSet<String>) -> Self {
        let registry = &store.shared.registry;
        let values = dependencies
            .iter()
            .map(|key| {
                let value = registry
                    .erased(key)
                    .map(|cell| (cell.value_any(), cell.type_name()));
                (key.clone(), value)
            })
            .collect();
        Self { values }
    }

    /// Value of `key` when present and of type `T`.
    #[must_use]
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.values
            .get(key)?
            .as_ref()
            .and_then(|(value, _)| value.downcast_ref::<T>())
    }

    /// Like [`get`](Self::get) but distinguishes absence from a type mismatch.
    pub fn try_get<T: 'static>(&self, key: &str) -> Result<Option<&T>> {
        match self.values.get(key) {
            Some(Some((value, type_name))) => value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or_else(|| StoreError::type_conflict::<T>(key, *type_name)),
            _ => Ok(None),
        }
    }

    /// Whether `key` currently exists in the store.
    #[must_use]
    pub fn is_present(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(Some(_)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for DependencySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.values
                    .iter()
                    .map(|(key, value)| (key, value.as_ref().map(|(_, ty)| *ty))),
            )
            .finish()
    }
}

type ComputeFn<T> = Box<dyn Fn(&DependencySnapshot) -> std::result::Result<T, BoxError>>;

struct Registration<T> {
    target: Rc<str>,
    dependencies: BTreeSet<String>,
    compute: ComputeFn<T>,
    last_value: RefCell<Option<T>>,
}

impl<T: CellValue> Registration<T> {
    fn recompute(&self, store: &Store, runs: &Cell<u64>) {
        let snapshot = DependencySnapshot::gather(store, &self.dependencies);
        let outcome =
            store.untracked(|| catch_unwind(AssertUnwindSafe(|| (self.compute)(&snapshot))));
        runs.set(runs.get() + 1);

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => {
                return self.fail(
                    store,
                    ComputeError::Failed {
                        target: self.target.to_string(),
                        source,
                    },
                );
            }
            Err(payload) => {
                return self.fail(
                    store,
                    ComputeError::Panicked {
                        target: self.target.to_string(),
                        message: panic_message(&*payload),
                    },
                );
            }
        };

        if self.last_value.borrow().as_ref() == Some(&value) {
            tracing::trace!(target_key = &*self.target, "computed value unchanged");
            return;
        }
        // Recorded before the write so a reentrant trigger sees the new value.
        let previous = self.last_value.replace(Some(value.clone()));
        if let Err(source) = store.write(
            &self.target,
            value,
            WriteOptions::from_source(COMPUTED_SOURCE),
        ) {
            *self.last_value.borrow_mut() = previous;
            self.fail(
                store,
                ComputeError::Write {
                    target: self.target.to_string(),
                    source,
                },
            );
        }
    }

    fn fail(&self, store: &Store, error: ComputeError) {
        store.report_fault(Component::Computed, Some(error.target()), &error.to_string());
    }
}

struct ComputedEntry {
    dependencies: BTreeSet<String>,
    observer: ObserverId,
    runs: Rc<Cell<u64>>,
}

/// Target key → live registration.
#[derive(Default)]
pub(crate) struct ComputedGraph {
    entries: RefCell<AHashMap<Rc<str>, ComputedEntry>>,
}

impl ComputedGraph {
    fn insert(&self, target: Rc<str>, entry: ComputedEntry) {
        self.entries.borrow_mut().insert(target, entry);
    }

    fn remove(&self, target: &str) -> Option<ComputedEntry> {
        self.entries.borrow_mut().remove(target)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Forget every registration. Observers are torn down by the bus.
    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Store {
    /// Register `target` as derived from `dependencies`.
    ///
    /// Replaces any prior registration for `target`, then computes once to
    /// seed the target cell. Fails only when `target` already holds a cell of
    /// another type.
    pub fn computed<T, D, K>(
        &self,
        target: &str,
        dependencies: D,
        compute: impl Fn(&DependencySnapshot) -> T + 'static,
    ) -> Result<()>
    where
        T: CellValue,
        D: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.register_computed(
            target,
            dependencies.into_iter().map(Into::into).collect(),
            Box::new(move |snapshot: &DependencySnapshot| {
                Ok::<T, BoxError>(compute(snapshot))
            }),
        )
    }

    /// Like [`computed`](Self::computed) for derivations that can fail.
    ///
    /// An `Err` is reported through the delegate and the target keeps its
    /// previous value.
    pub fn computed_fallible<T, E, D, K>(
        &self,
        target: &str,
        dependencies: D,
        compute: impl Fn(&DependencySnapshot) -> std::result::Result<T, E> + 'static,
    ) -> Result<()>
    where
        T: CellValue,
        E: Into<BoxError>,
        D: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.register_computed(
            target,
            dependencies.into_iter().map(Into::into).collect(),
            Box::new(move |snapshot: &DependencySnapshot| compute(snapshot).map_err(Into::into)),
        )
    }

    /// Detach the registration for `target`. The target cell keeps its value.
    pub fn uncompute(&self, target: &str) -> bool {
        let Some(entry) = self.shared.computed.remove(target) else {
            return false;
        };
        self.unsubscribe_state(entry.observer);
        tracing::debug!(target_key = target, "computed registration removed");
        true
    }

    /// Registered computed targets, sorted.
    #[must_use]
    pub fn computed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shared
            .computed
            .entries
            .borrow()
            .keys()
            .map(|k| k.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Declared dependencies of `target`, sorted.
    #[must_use]
    pub fn computed_dependencies(&self, target: &str) -> Option<Vec<String>> {
        self.shared
            .computed
            .entries
            .borrow()
            .get(target)
            .map(|entry| entry.dependencies.iter().cloned().collect())
    }

    /// Number of times `target` has been recomputed, including the seed.
    #[must_use]
    pub fn computed_runs(&self, target: &str) -> Option<u64> {
        self.shared
            .computed
            .entries
            .borrow()
            .get(target)
            .map(|entry| entry.runs.get())
    }

    fn register_computed<T: CellValue>(
        &self,
        target: &str,
        dependencies: BTreeSet<String>,
        compute: ComputeFn<T>,
    ) -> Result<()> {
        self.shared.registry.lookup::<T>(target)?;
        self.uncompute(target);

        let registration = Rc::new(Registration {
            target: Rc::from(target),
            dependencies: dependencies.clone(),
            compute,
            last_value: RefCell::new(None),
        });
        let runs = Rc::new(Cell::new(0));

        let weak = self.downgrade();
        let observed = Rc::clone(&registration);
        let observed_runs = Rc::clone(&runs);
        let observer = self.subscribe_state(move |change| {
            if !observed.dependencies.contains(change.key()) {
                return;
            }
            if let Some(store) = weak.upgrade() {
                observed.recompute(&store, &observed_runs);
            }
        });

        self.shared.computed.insert(
            Rc::clone(&registration.target),
            ComputedEntry {
                dependencies,
                observer,
                runs: Rc::clone(&runs),
            },
        );
        tracing::debug!(
            target_key = target,
            type_name = std::any::type_name::<T>(),
            "computed registration added"
        );

        registration.recompute(self, &runs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::RecordingDelegate;
    use crate::store::StoreConfig;

    fn store_with_recorder() -> (Store, Rc<RecordingDelegate>) {
        let delegate = RecordingDelegate::new();
        (
            Store::with_delegate(StoreConfig::default(), delegate.clone()),
            delegate,
        )
    }

    fn sum(snapshot: &DependencySnapshot) -> i32 {
        let a = snapshot.get::<i32>("a").copied().unwrap_or(0);
        let b = snapshot.get::<i32>("b").copied().unwrap_or(0);
        a + b
    }

    fn count_changes(store: &Store, key: &str) -> Rc<Cell<u32>> {
        let hits = Rc::new(Cell::new(0));
        let hits_clone = Rc::clone(&hits);
        store.subscribe_key(key, move |_| hits_clone.set(hits_clone.get() + 1));
        hits
    }

    #[test]
    fn seeds_and_follows_dependencies() {
        let store = Store::new();
        store.write("a", 2, WriteOptions::default()).unwrap();
        store.write("b", 3, WriteOptions::default()).unwrap();
        store.computed("sum", ["a", "b"], sum).unwrap();
        assert_eq!(store.read::<i32>("sum").unwrap(), Some(5));

        store.write("a", 10, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("sum").unwrap(), Some(13));
        assert_eq!(store.computed_runs("sum"), Some(2));
    }

    #[test]
    fn unrelated_keys_do_not_recompute() {
        let store = Store::new();
        store.computed("sum", ["a", "b"], sum).unwrap();
        store.write("other", 1, WriteOptions::default()).unwrap();
        assert_eq!(store.computed_runs("sum"), Some(1));
    }

    #[test]
    fn equal_results_are_written_once() {
        let store = Store::new();
        store.write("a", 1, WriteOptions::default()).unwrap();
        let hits = count_changes(&store, "parity");
        store
            .computed("parity", ["a"], |s| s.get::<i32>("a").copied().unwrap_or(0) % 2)
            .unwrap();
        assert_eq!(hits.get(), 1);

        store.write("a", 3, WriteOptions::default()).unwrap();
        store.write("a", 5, WriteOptions::default()).unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(store.computed_runs("parity"), Some(3));

        store.write("a", 6, WriteOptions::default()).unwrap();
        assert_eq!(hits.get(), 2);
        assert_eq!(store.read::<i32>("parity").unwrap(), Some(0));
    }

    #[test]
    fn writes_are_attributed_to_computed() {
        let store = Store::new();
        let sources = Rc::new(RefCell::new(Vec::new()));
        let sources_clone = Rc::clone(&sources);
        store.subscribe_key("double", move |change| {
            sources_clone
                .borrow_mut()
                .push(change.source_module_id().map(str::to_owned));
        });
        store.write("a", 4, WriteOptions::default()).unwrap();
        store
            .computed("double", ["a"], |s| s.get::<i32>("a").copied().unwrap_or(0) * 2)
            .unwrap();
        assert_eq!(*sources.borrow(), vec![Some(COMPUTED_SOURCE.to_owned())]);
    }

    #[test]
    fn failure_keeps_previous_value() {
        let (store, delegate) = store_with_recorder();
        store.write("a", 4, WriteOptions::default()).unwrap();
        store
            .computed_fallible("root", ["a"], |s| {
                let a = s.get::<i32>("a").copied().unwrap_or(0);
                if a < 0 {
                    Err(format!("negative input {a}"))
                } else {
                    Ok(a * 10)
                }
            })
            .unwrap();
        assert_eq!(store.read::<i32>("root").unwrap(), Some(40));

        store.write("a", -1, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("root").unwrap(), Some(40));
        let errors = delegate.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].component, Component::Computed);
        assert_eq!(errors[0].key.as_deref(), Some("root"));
        assert!(errors[0].message.contains("negative input -1"));

        store.write("a", 2, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("root").unwrap(), Some(20));
    }

    #[test]
    fn panic_is_isolated() {
        let (store, delegate) = store_with_recorder();
        store.write("a", 1, WriteOptions::default()).unwrap();
        store
            .computed("inv", ["a"], |s| {
                let a = s.get::<i32>("a").copied().unwrap_or(0);
                assert!(a != 0, "division by zero");
                100 / a
            })
            .unwrap();
        store.write("a", 0, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("inv").unwrap(), Some(100));
        assert_eq!(delegate.errors().len(), 1);
        assert!(delegate.errors()[0].message.contains("panicked"));
    }

    #[test]
    fn absent_dependencies_are_marked() {
        let store = Store::new();
        store
            .computed("has_user", ["user.id"], |s| s.is_present("user.id"))
            .unwrap();
        assert_eq!(store.read::<bool>("has_user").unwrap(), Some(false));
        store.write("user.id", 7u64, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<bool>("has_user").unwrap(), Some(true));
    }

    #[test]
    fn try_get_reports_type_mismatch() {
        let store = Store::new();
        store.write("a", String::from("x"), WriteOptions::default()).unwrap();
        store
            .computed("presence", ["a", "missing"], |s| {
                (
                    s.try_get::<i32>("a").is_err(),
                    matches!(s.try_get::<i32>("missing"), Ok(None)),
                )
            })
            .unwrap();
        assert_eq!(store.read::<(bool, bool)>("presence").unwrap(), Some((true, true)));
    }

    #[test]
    fn re_register_replaces() {
        let store = Store::new();
        store.write("a", 1, WriteOptions::default()).unwrap();
        store.computed("t", ["a"], |_| 1).unwrap();
        store.computed("t", ["a"], |_| 2).unwrap();
        assert_eq!(store.read::<i32>("t").unwrap(), Some(2));
        assert_eq!(store.observer_counts().states, 1);
        assert_eq!(store.observer_counts().computed, 1);
        assert_eq!(store.computed_keys(), vec!["t".to_owned()]);
    }

    #[test]
    fn uncompute_keeps_value_and_detaches() {
        let store = Store::new();
        store.write("a", 1, WriteOptions::default()).unwrap();
        store
            .computed("copy", ["a"], |s| s.get::<i32>("a").copied().unwrap_or(0))
            .unwrap();
        assert!(store.uncompute("copy"));
        assert!(!store.uncompute("copy"));
        store.write("a", 9, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("copy").unwrap(), Some(1));
        assert_eq!(store.observer_counts().states, 0);
        assert!(store.computed_dependencies("copy").is_none());
    }

    #[test]
    fn registration_checks_target_type() {
        let store = Store::new();
        store.write("t", String::new(), WriteOptions::default()).unwrap();
        let err = store.computed("t", ["a"], |_| 1i32).unwrap_err();
        assert!(matches!(err, StoreError::TypeConflict { .. }));
        assert!(store.computed_keys().is_empty());
    }

    #[test]
    fn chains_cascade() {
        let store = Store::new();
        store.write("a", 1, WriteOptions::default()).unwrap();
        store
            .computed("b", ["a"], |s| s.get::<i32>("a").copied().unwrap_or(0) + 1)
            .unwrap();
        store
            .computed("c", ["b"], |s| s.get::<i32>("b").copied().unwrap_or(0) * 10)
            .unwrap();
        assert_eq!(store.read::<i32>("c").unwrap(), Some(20));
        store.write("a", 4, WriteOptions::default()).unwrap();
        assert_eq!(store.read::<i32>("c").unwrap(), Some(50));
        assert_eq!(
            store.computed_dependencies("c"),
            Some(vec!["b".to_owned()])
        );
    }

    #[test]
    fn compute_reads_are_not_tracked() {
        let store = Store::new();
        store.write("a", 1, WriteOptions::default()).unwrap();
        store.write("hidden", 5, WriteOptions::default()).unwrap();
        let reader = store.downgrade();
        let (_, deps) = store.evaluate(|| {
            store
                .computed("t", ["a"], move |_| {
                    reader
                        .upgrade()
                        .and_then(|s| s.read::<i32>("hidden").ok().flatten())
                        .unwrap_or(0)
                })
                .unwrap();
        });
        assert!(!deps.contains_key("hidden"));
    }
}
