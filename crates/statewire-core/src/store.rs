#![forbid(unsafe_code)]

//! The runtime instance.
//!
//! A [`Store`] owns one registry, one watcher stack, one observer bus, and
//! one computed graph. Instances are fully isolated from each other; there is
//! no process-wide state apart from the cell id counter.
//!
//! # Write path
//!
//! 1. Equality short-circuit (skipped with `force`).
//! 2. Cross-module audit through the delegate when the writer's module
//!    differs from the key's namespace.
//! 3. Unless `silent`: the cell's own listeners, then every state observer.
//!    Both run with tracking suspended, so their reads never leak into an
//!    evaluation that is writing.
//!
//! A cell removed from the registry keeps working through surviving
//! handles, but its writes reach only its own listeners.
//!
//! Callbacks run synchronously and may write again; every internal borrow is
//! released before a callback is invoked.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::bus::{
    Action, ActionBus, ActionCallback, ActionEnvelope, ObserverId, PulseOptions, StateCallback,
    StateChange,
};
use crate::cell::{CellInner, CellValue, ErasedCell, StateCell};
use crate::computed::ComputedGraph;
use crate::delegate::{
    Component, Delegate, HostCallback, InteractionKind, LogContext, SubscriptionHandle,
    TracingDelegate,
};
use crate::error::{Result, StoreError};
use crate::registry::{Registry, RegistrySnapshot};
use crate::watcher::{DependencySet, Reaction, Watcher, WatcherContext};

/// Store-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Separates a key's module namespace from the rest (`"cart.total"`).
    pub namespace_separator: char,
    /// Report writes that cross module namespaces to the delegate.
    pub audit_interactions: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace_separator: '.',
            audit_interactions: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_namespace_separator(mut self, separator: char) -> Self {
        self.namespace_separator = separator;
        self
    }

    #[must_use]
    pub fn with_interaction_audit(mut self, enabled: bool) -> Self {
        self.audit_interactions = enabled;
        self
    }
}

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Module performing the write, used for the cross-module audit.
    pub source_module_id: Option<String>,
    /// Store the value without notifying anyone.
    pub silent: bool,
    /// Notify even when the new value equals the current one.
    pub force: bool,
}

impl WriteOptions {
    #[must_use]
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source_module_id: Some(source.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Live observer counts, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverCounts {
    pub actions: usize,
    pub states: usize,
    pub computed: usize,
}

pub(crate) struct Shared {
    pub(crate) config: StoreConfig,
    pub(crate) registry: Registry,
    pub(crate) watchers: WatcherContext,
    pub(crate) bus: ActionBus,
    pub(crate) computed: ComputedGraph,
    pub(crate) delegate: Rc<dyn Delegate>,
}

/// Handle to a reactive runtime instance. Clones share the same state.
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Rc<Shared>,
}

/// Non-owning handle, for callbacks that live inside the store.
#[derive(Clone, Default)]
pub struct WeakStore {
    shared: Weak<Shared>,
}

impl WeakStore {
    #[must_use]
    pub fn upgrade(&self) -> Option<Store> {
        self.shared.upgrade().map(|shared| Store { shared })
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStore")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("cells", &self.shared.registry.len())
            .field("observers", &self.observer_counts())
            .field("channels", &self.shared.bus.channel_count())
            .field("tracking_depth", &self.shared.watchers.depth())
            .finish()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_delegate(config, Rc::new(TracingDelegate::new()))
    }

    #[must_use]
    pub fn with_delegate(config: StoreConfig, delegate: Rc<dyn Delegate>) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                registry: Registry::default(),
                watchers: WatcherContext::default(),
                bus: ActionBus::default(),
                computed: ComputedGraph::default(),
                delegate,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn delegate(&self) -> Rc<dyn Delegate> {
        Rc::clone(&self.shared.delegate)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Whether both handles refer to the same runtime instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Handle to the cell at `key`, creating it from `initial` if absent.
    pub fn cell<T: CellValue>(&self, key: &str, initial: Option<T>) -> Result<StateCell<T>> {
        let (cell, _) = self.shared.registry.get_or_create(key, initial)?;
        Ok(StateCell::from_parts(cell, self.downgrade()))
    }

    pub fn cell_or_default<T: CellValue + Default>(&self, key: &str) -> Result<StateCell<T>> {
        match self.shared.registry.lookup::<T>(key)? {
            Some(cell) => Ok(StateCell::from_parts(cell, self.downgrade())),
            None => self.cell(key, Some(T::default())),
        }
    }

    /// Current value at `key` (tracked). `Ok(None)` when the key is absent.
    pub fn read<T: CellValue>(&self, key: &str) -> Result<Option<T>> {
        let Some(cell) = self.shared.registry.lookup::<T>(key)? else {
            return Ok(None);
        };
        self.track_read(&cell);
        Ok(Some(cell.get()))
    }

    /// Current value at `key` (tracked), creating the cell from `initial`.
    pub fn read_or<T: CellValue>(&self, key: &str, initial: T) -> Result<T> {
        let (cell, _) = self.shared.registry.get_or_create(key, Some(initial))?;
        self.track_read(&cell);
        Ok(cell.get())
    }

    pub fn read_or_default<T: CellValue + Default>(&self, key: &str) -> Result<T> {
        Ok(self.cell_or_default::<T>(key)?.get())
    }

    /// Assign `value` to `key`, creating the cell if absent.
    ///
    /// A write that creates the cell notifies like any other change.
    pub fn write<T: CellValue>(&self, key: &str, value: T, options: WriteOptions) -> Result<()> {
        if let Some(cell) = self.shared.registry.lookup::<T>(key)? {
            self.commit(&cell, value, &options);
            return Ok(());
        }
        let (cell, _) = self.shared.registry.get_or_create(key, Some(value))?;
        let source = options.source_module_id.as_deref();
        self.audit(key, source, InteractionKind::Write);
        if !options.silent {
            self.publish(&cell, Rc::new(cell.get()), source, options.force);
        }
        Ok(())
    }

    /// Mutate the value at `key` in place and notify unconditionally.
    ///
    /// Fails with [`StoreError::MissingInitialValue`] when the key is absent.
    pub fn update<T: CellValue>(
        &self,
        key: &str,
        f: impl FnOnce(&mut T),
        options: WriteOptions,
    ) -> Result<()> {
        let cell = self
            .shared
            .registry
            .lookup::<T>(key)?
            .ok_or_else(|| StoreError::missing_initial::<T>(key))?;
        let snapshot = cell.modify(f);
        let source = options.source_module_id.as_deref();
        self.audit(key, source, InteractionKind::Write);
        if !options.silent {
            self.publish(&cell, snapshot, source, true);
        }
        Ok(())
    }

    /// Re-broadcast the current value at `key`. Returns `false` if absent.
    pub fn force_notify(&self, key: &str, options: WriteOptions) -> bool {
        let Some(cell) = self.shared.registry.erased(key) else {
            return false;
        };
        let source = options.source_module_id.as_deref();
        self.audit(key, source, InteractionKind::ForceNotify);
        let _untracked = self.shared.watchers.enter_untracked();
        let (value, version) = cell.republish(&|listener, message| {
            self.report_fault(
                Component::Registry,
                Some(key),
                &format!("listener {} panicked: {message}", listener.raw()),
            );
        });
        let change = StateChange::new(
            Rc::clone(cell.key()),
            value,
            version,
            source.map(Rc::from),
            true,
        );
        self.dispatch_state(&change);
        true
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.shared.registry.contains(key)
    }

    /// Detach and discard the cell at `key`.
    ///
    /// Watchers still holding the removed cell are not notified; they drop
    /// it on their next evaluation.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shared.registry.remove(key);
        if removed {
            tracing::debug!(key, "cell removed");
        }
        removed
    }

    /// All keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.shared.registry.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.registry.len() == 0
    }

    /// Read-only view of every cell, for debug tooling.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.shared.registry.snapshot()
    }

    /// Tear down every cell, observer, and computed registration.
    ///
    /// The store remains usable; observer ids keep increasing.
    pub fn clear(&self) {
        self.shared.computed.clear();
        self.shared.bus.clear_observers();
        self.shared.registry.clear();
        tracing::debug!("store cleared");
    }

    // ------------------------------------------------------------------
    // Dependency tracking
    // ------------------------------------------------------------------

    /// Run `f` as a tracked evaluation and return what it read.
    pub fn evaluate<R>(&self, f: impl FnOnce() -> R) -> (R, DependencySet) {
        let scope = self.shared.watchers.enter();
        let result = f();
        (result, scope.finish())
    }

    /// Run `f` without recording any reads into the active evaluation.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let scope = self.shared.watchers.enter_untracked();
        let result = f();
        drop(scope);
        result
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.shared.watchers.is_tracking()
    }

    /// Number of evaluation frames currently on the stack.
    #[must_use]
    pub fn tracking_depth(&self) -> usize {
        self.shared.watchers.depth()
    }

    pub fn watcher(&self, on_change: impl Fn() + 'static) -> Watcher {
        Watcher::new(self, on_change)
    }

    pub fn react(&self, body: impl FnMut() + 'static) -> Reaction {
        Reaction::new(self, body)
    }

    // ------------------------------------------------------------------
    // Observer bus
    // ------------------------------------------------------------------

    pub fn subscribe_state(&self, callback: impl Fn(&StateChange) + 'static) -> ObserverId {
        self.shared.bus.states.subscribe(Rc::new(callback))
    }

    /// Like [`subscribe_state`](Self::subscribe_state), keeping the `Rc` so
    /// the caller can later remove it by identity.
    pub fn subscribe_state_rc(&self, callback: Rc<StateCallback>) -> ObserverId {
        self.shared.bus.states.subscribe(callback)
    }

    /// State observer filtered to a single key.
    pub fn subscribe_key(
        &self,
        key: &str,
        callback: impl Fn(&StateChange) + 'static,
    ) -> ObserverId {
        let key: Rc<str> = Rc::from(key);
        self.subscribe_state(move |change| {
            if change.key() == &*key {
                callback(change);
            }
        })
    }

    pub fn unsubscribe_state(&self, id: ObserverId) -> bool {
        self.shared.bus.states.unsubscribe(id)
    }

    /// Legacy removal by callback identity.
    pub fn remove_state_callback(&self, callback: &Rc<StateCallback>) -> bool {
        self.shared.bus.states.remove_callback(callback)
    }

    /// Observe every pulsed action regardless of name or payload type.
    pub fn subscribe_actions(&self, callback: impl Fn(&ActionEnvelope) + 'static) -> ObserverId {
        self.shared.bus.actions.subscribe(Rc::new(callback))
    }

    pub fn subscribe_actions_rc(&self, callback: Rc<ActionCallback>) -> ObserverId {
        self.shared.bus.actions.subscribe(callback)
    }

    pub fn unsubscribe_actions(&self, id: ObserverId) -> bool {
        self.shared.bus.actions.unsubscribe(id)
    }

    /// Legacy removal by callback identity.
    pub fn remove_action_callback(&self, callback: &Rc<ActionCallback>) -> bool {
        self.shared.bus.actions.remove_callback(callback)
    }

    #[must_use]
    pub fn observer_counts(&self) -> ObserverCounts {
        ObserverCounts {
            actions: self.shared.bus.actions.len(),
            states: self.shared.bus.states.len(),
            computed: self.shared.computed.len(),
        }
    }

    /// Typed channel for `name`. The first request binds the payload type.
    pub fn action<P: 'static>(&self, name: &str) -> Result<Action<P>> {
        self.shared.bus.channel::<P>(name)
    }

    /// Observe one typed action.
    pub fn on_action<P: 'static>(
        &self,
        action: &Action<P>,
        callback: impl Fn(&P, &ActionEnvelope) + 'static,
    ) -> ObserverId {
        let name: Rc<str> = Rc::from(action.name());
        let weak = self.downgrade();
        self.subscribe_actions(move |envelope| {
            if envelope.action() != &*name {
                return;
            }
            match envelope.payload::<P>() {
                Some(payload) => callback(payload, envelope),
                None => {
                    if let Some(store) = weak.upgrade() {
                        store.report_fault(
                            Component::Bus,
                            Some(&*name),
                            &format!(
                                "payload for `{name}` is not {}",
                                std::any::type_name::<P>()
                            ),
                        );
                    }
                }
            }
        })
    }

    /// Fire-and-forget: deliver to local action observers, then to the
    /// delegate's transport.
    pub fn pulse<P: 'static>(&self, action: &Action<P>, payload: P, options: PulseOptions) {
        let envelope = action.envelope(payload, options);
        let _untracked = self.shared.watchers.enter_untracked();
        self.shared.bus.actions.dispatch(&envelope, &|id, message| {
            self.report_fault(
                Component::Bus,
                Some(envelope.action()),
                &format!("action observer {} panicked: {message}", id.raw()),
            );
        });
        self.shared.delegate.pulse(
            envelope.action(),
            envelope.payload_rc(),
            envelope.source_module_id(),
        );
    }

    /// Host-side delivery through the delegate's transport.
    pub fn host_subscribe(&self, action: &str, callback: HostCallback) -> SubscriptionHandle {
        self.shared.delegate.subscribe(action, callback)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Shared write path for [`Store::write`] and [`StateCell::set_with`].
    pub(crate) fn commit<T: CellValue>(
        &self,
        cell: &Rc<CellInner<T>>,
        value: T,
        options: &WriteOptions,
    ) -> bool {
        let Some(snapshot) = cell.assign(value, options.force) else {
            return false;
        };
        if cell.is_detached() {
            if !options.silent {
                let _untracked = self.shared.watchers.enter_untracked();
                self.notify_listeners(cell, &snapshot);
            }
            return true;
        }
        let source = options.source_module_id.as_deref();
        self.audit(cell.key(), source, InteractionKind::Write);
        if !options.silent {
            self.publish(cell, snapshot, source, options.force);
        }
        true
    }

    pub(crate) fn track_read<T: CellValue>(&self, cell: &Rc<CellInner<T>>) {
        if self.shared.watchers.is_tracking() {
            let erased: Rc<dyn ErasedCell> = Rc::clone(cell) as Rc<dyn ErasedCell>;
            self.shared.watchers.record(&erased);
        }
    }

    pub(crate) fn report_fault(&self, component: Component, key: Option<&str>, message: &str) {
        let context = match key {
            Some(key) => LogContext::new(component).with_key(key),
            None => LogContext::new(component),
        };
        self.shared.delegate.log(message, &context, true);
    }

    fn publish<T: CellValue>(
        &self,
        cell: &CellInner<T>,
        snapshot: Rc<T>,
        source: Option<&str>,
        forced: bool,
    ) {
        // Reads made by listeners and observers belong to them, not to the
        // evaluation that happens to be writing.
        let _untracked = self.shared.watchers.enter_untracked();
        let version = cell.version();
        self.notify_listeners(cell, &snapshot);
        let change = StateChange::new(
            Rc::clone(cell.key()),
            snapshot,
            version,
            source.map(Rc::from),
            forced,
        );
        self.dispatch_state(&change);
    }

    fn notify_listeners<T: CellValue>(&self, cell: &CellInner<T>, snapshot: &T) {
        let key: &str = cell.key();
        cell.notify(snapshot, &|listener, message| {
            self.report_fault(
                Component::Registry,
                Some(key),
                &format!("listener {} panicked: {message}", listener.raw()),
            );
        });
    }

    fn dispatch_state(&self, change: &StateChange) {
        self.shared.bus.states.dispatch(change, &|id, message| {
            self.report_fault(
                Component::Bus,
                Some(change.key()),
                &format!("state observer {} panicked: {message}", id.raw()),
            );
        });
    }

    fn audit(&self, key: &str, source: Option<&str>, kind: InteractionKind) {
        if !self.shared.config.audit_interactions {
            return;
        }
        let Some(source) = source else {
            return;
        };
        let Some((namespace, _)) = key.split_once(self.shared.config.namespace_separator) else {
            return;
        };
        if namespace != source {
            self.shared
                .delegate
                .record_interaction(source, namespace, kind, key);
        }
    }
}
