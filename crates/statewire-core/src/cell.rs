#![forbid(unsafe_code)]

//! Named, versioned value holders.
//!
//! A [`StateCell<T>`] is a handle to one entry of the registry. The cell owns
//! its value exclusively; listeners only ever see a shared reference to the
//! snapshot taken at notification time.
//!
//! # Invariants
//!
//! 1. `version` increments exactly once per accepted assignment, forced
//!    notification, or in-place update.
//! 2. Listeners are notified in registration order.
//! 3. A listener callback is registered at most once (identity by `Rc`).
//! 4. A panicking listener does not prevent delivery to later listeners.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::panic_message;
use crate::store::{Store, WeakStore, WriteOptions};

/// Bound shared by every value stored in a cell.
pub trait CellValue: Clone + PartialEq + 'static {}

impl<T: Clone + PartialEq + 'static> CellValue for T {}

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a cell.
///
/// Removing a key and creating it again yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identifies a listener within one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

pub(crate) type Listener<T> = Rc<dyn Fn(&T)>;

/// Called with the listener id and panic message when a listener panics.
pub(crate) type FaultSink<'a> = &'a dyn Fn(ListenerId, String);

pub(crate) struct CellInner<T> {
    id: CellId,
    key: Rc<str>,
    value: RefCell<T>,
    version: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Listener<T>)>>,
    next_listener: Cell<u64>,
    detached: Cell<bool>,
}

impl<T> fmt::Debug for CellInner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellInner")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("version", &self.version.get())
            .field("detached", &self.detached.get())
            .finish_non_exhaustive()
    }
}

impl<T: CellValue> CellInner<T> {
    pub(crate) fn new(key: Rc<str>, value: T) -> Self {
        Self {
            id: CellId::next(),
            key,
            value: RefCell::new(value),
            version: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
            detached: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    pub(crate) fn key(&self) -> &Rc<str> {
        &self.key
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.get()
    }

    /// Whether the registry has dropped this cell. Writes through surviving
    /// handles then reach only the cell's own listeners.
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.get()
    }

    pub(crate) fn get(&self) -> T {
        self.value.borrow().clone()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.borrow())
    }

    /// Store `value` unless it equals the current one and `force` is off.
    ///
    /// Returns the snapshot to publish when the assignment was accepted.
    pub(crate) fn assign(&self, value: T, force: bool) -> Option<Rc<T>> {
        {
            let mut current = self.value.borrow_mut();
            if !force && *current == value {
                return None;
            }
            *current = value;
        }
        self.version.set(self.version.get() + 1);
        Some(Rc::new(self.get()))
    }

    /// Mutate the value in place. Always counts as a change.
    pub(crate) fn modify(&self, f: impl FnOnce(&mut T)) -> Rc<T> {
        f(&mut self.value.borrow_mut());
        self.version.set(self.version.get() + 1);
        Rc::new(self.get())
    }

    /// Bump the version without changing the value.
    pub(crate) fn touch(&self) -> Rc<T> {
        self.version.set(self.version.get() + 1);
        Rc::new(self.get())
    }

    pub(crate) fn subscribe(&self, listener: Listener<T>) -> ListenerId {
        let mut listeners = self.listeners.borrow_mut();
        if let Some((id, _)) = listeners
            .iter()
            .find(|(_, existing)| std::ptr::addr_eq(Rc::as_ptr(existing), Rc::as_ptr(&listener)))
        {
            return *id;
        }
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        listeners.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Deliver `snapshot` to a point-in-time copy of the listener list.
    pub(crate) fn notify(&self, snapshot: &T, on_fault: FaultSink<'_>) {
        let listeners: Vec<(ListenerId, Listener<T>)> = self.listeners.borrow().clone();
        for (id, listener) in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(snapshot))) {
                on_fault(id, panic_message(&*payload));
            }
        }
    }
}

/// Type-erased view of a cell used by the registry and dependency tracking.
pub(crate) trait ErasedCell {
    fn id(&self) -> CellId;
    fn key(&self) -> &Rc<str>;
    fn value_type_id(&self) -> TypeId;
    fn type_name(&self) -> &'static str;
    fn version(&self) -> u64;
    fn listener_count(&self) -> usize;
    /// Clone the current value behind an `Rc<dyn Any>`.
    fn value_any(&self) -> Rc<dyn Any>;
    /// Register an untyped change callback.
    fn subscribe_change(&self, callback: Rc<dyn Fn()>) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId) -> bool;
    /// Bump the version and notify listeners with the unchanged value.
    fn republish(&self, on_fault: FaultSink<'_>) -> (Rc<dyn Any>, u64);
    /// Mark the cell as no longer reachable from the registry.
    fn detach(&self);
}

impl<T: CellValue> ErasedCell for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn key(&self) -> &Rc<str> {
        &self.key
    }

    fn value_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn version(&self) -> u64 {
        self.version.get()
    }

    fn listener_count(&self) -> usize {
        CellInner::listener_count(self)
    }

    fn value_any(&self) -> Rc<dyn Any> {
        Rc::new(self.get())
    }

    fn subscribe_change(&self, callback: Rc<dyn Fn()>) -> ListenerId {
        self.subscribe(Rc::new(move |_: &T| callback()))
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        CellInner::unsubscribe(self, id)
    }

    fn republish(&self, on_fault: FaultSink<'_>) -> (Rc<dyn Any>, u64) {
        let snapshot = self.touch();
        let version = self.version.get();
        self.notify(&snapshot, on_fault);
        let value: Rc<dyn Any> = snapshot;
        (value, version)
    }

    fn detach(&self) {
        self.detached.set(true);
    }
}

/// Handle to a single registry cell.
///
/// Cloning creates another handle to the same cell. Reads through
/// [`get`](Self::get) and [`with`](Self::with) register the cell with the
/// active tracked evaluation, if any.
pub struct StateCell<T> {
    inner: Rc<CellInner<T>>,
    store: WeakStore,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            store: self.store.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("key", &self.inner.key)
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

impl<T: CellValue> StateCell<T> {
    pub(crate) fn from_parts(inner: Rc<CellInner<T>>, store: WeakStore) -> Self {
        Self { inner, store }
    }

    pub(crate) fn inner(&self) -> &Rc<CellInner<T>> {
        &self.inner
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    #[must_use]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Current value (tracked).
    #[must_use]
    pub fn get(&self) -> T {
        self.track();
        self.inner.get()
    }

    /// Access the current value by reference (tracked).
    ///
    /// # Panics
    ///
    /// Panics if `f` writes to this same cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        self.inner.with(f)
    }

    /// Current value without registering a dependency.
    #[must_use]
    pub fn peek(&self) -> T {
        self.inner.get()
    }

    /// Assign a new value through the store's normal write path.
    pub fn set(&self, value: T) {
        self.set_with(value, WriteOptions::default());
    }

    /// Assign with explicit write options. Returns whether the value was accepted.
    pub fn set_with(&self, value: T, options: WriteOptions) -> bool {
        match self.store.upgrade() {
            Some(store) => store.commit(&self.inner, value, &options),
            // Detached from its store: only the cell's own listeners remain.
            None => match self.inner.assign(value, options.force) {
                Some(snapshot) if !options.silent => {
                    let key: &str = self.inner.key();
                    self.inner.notify(&snapshot, &|listener, message| {
                        tracing::error!(
                            component = "registry",
                            key,
                            listener = listener.raw(),
                            "listener panicked on a cell without a store: {message}"
                        );
                    });
                    true
                }
                Some(_) => true,
                None => false,
            },
        }
    }

    /// Version number; increments once per accepted change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// Register a listener invoked with every new value.
    ///
    /// Registering the same `Rc` twice returns the existing id.
    pub fn subscribe_rc(&self, listener: Rc<dyn Fn(&T)>) -> ListenerId {
        self.inner.subscribe(listener)
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> ListenerId {
        self.inner.subscribe(Rc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.unsubscribe(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }

    /// The store this cell belongs to, if it is still alive.
    #[must_use]
    pub fn store(&self) -> Option<Store> {
        self.store.upgrade()
    }

    fn track(&self) {
        if let Some(store) = self.store.upgrade() {
            store.track_read(&self.inner);
        }
    }
}
