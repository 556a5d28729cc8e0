#![forbid(unsafe_code)]

//! Observer lists for the two notification classes.
//!
//! - **State changed**: one [`StateChange`] per accepted (non-silent) write.
//! - **Action pulsed**: one [`ActionEnvelope`] per [`pulse`](crate::Store::pulse).
//!
//! # Invariants
//!
//! 1. [`ObserverId`]s increase monotonically per class and are never reused,
//!    not even after [`ObserverList::clear`].
//! 2. Within a class, delivery follows registration order.
//! 3. Dispatch iterates a point-in-time copy: observers added or removed by a
//!    callback take effect from the next dispatch.
//! 4. A panicking observer is isolated; later observers still run.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::{Result, StoreError, panic_message};

/// Identifies an observer within one notification class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

pub type StateCallback = dyn Fn(&StateChange);
pub type ActionCallback = dyn Fn(&ActionEnvelope);

type Entry<E> = (ObserverId, Rc<dyn Fn(&E)>);

/// Ordered, id-addressable observer list.
///
/// Removal by id is O(1) on average: the slot is tombstoned and the index
/// entry dropped. Tombstones are compacted once they outnumber live entries.
pub(crate) struct ObserverList<E> {
    next_id: Cell<u64>,
    slots: RefCell<Vec<Option<Entry<E>>>>,
    index: RefCell<AHashMap<ObserverId, usize>>,
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self {
            next_id: Cell::new(1),
            slots: RefCell::new(Vec::new()),
            index: RefCell::new(AHashMap::new()),
        }
    }
}

const COMPACT_MIN_SLOTS: usize = 16;

impl<E> ObserverList<E> {
    pub(crate) fn subscribe(&self, callback: Rc<dyn Fn(&E)>) -> ObserverId {
        let id = ObserverId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let mut slots = self.slots.borrow_mut();
        self.index.borrow_mut().insert(id, slots.len());
        slots.push(Some((id, callback)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ObserverId) -> bool {
        let Some(pos) = self.index.borrow_mut().remove(&id) else {
            return false;
        };
        let removed = self.slots.borrow_mut()[pos].take();
        self.maybe_compact();
        // Dropped after the borrows end; the closure may own store handles.
        drop(removed);
        true
    }

    /// Legacy removal by callback identity. Linear scan.
    pub(crate) fn remove_callback(&self, callback: &Rc<dyn Fn(&E)>) -> bool {
        let found = self.slots.borrow().iter().flatten().find_map(|(id, existing)| {
            std::ptr::addr_eq(Rc::as_ptr(existing), Rc::as_ptr(callback)).then_some(*id)
        });
        found.is_some_and(|id| self.unsubscribe(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.index.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ObserverId) -> bool {
        self.index.borrow().contains_key(&id)
    }

    /// Drop every observer. The id counter keeps counting.
    pub(crate) fn clear(&self) {
        self.index.borrow_mut().clear();
        let drained = std::mem::take(&mut *self.slots.borrow_mut());
        drop(drained);
    }

    fn snapshot(&self) -> Vec<Entry<E>> {
        self.slots.borrow().iter().flatten().cloned().collect()
    }

    /// Deliver `event` to every observer registered when dispatch began.
    pub(crate) fn dispatch(&self, event: &E, on_fault: &dyn Fn(ObserverId, String)) {
        for (id, callback) in self.snapshot() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                on_fault(id, panic_message(&*payload));
            }
        }
    }

    fn maybe_compact(&self) {
        let mut slots = self.slots.borrow_mut();
        let live = self.index.borrow().len();
        if slots.len() < COMPACT_MIN_SLOTS || slots.len() - live <= live {
            return;
        }
        slots.retain(Option::is_some);
        let mut index = self.index.borrow_mut();
        for (pos, slot) in slots.iter().enumerate() {
            if let Some((id, _)) = slot {
                index.insert(*id, pos);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }
}

/// Payload of the "state changed" class.
#[derive(Clone)]
pub struct StateChange {
    key: Rc<str>,
    value: Rc<dyn Any>,
    version: u64,
    source_module_id: Option<Rc<str>>,
    forced: bool,
}

impl StateChange {
    pub(crate) fn new(
        key: Rc<str>,
        value: Rc<dyn Any>,
        version: u64,
        source_module_id: Option<Rc<str>>,
        forced: bool,
    ) -> Self {
        Self {
            key,
            value,
            version,
            source_module_id,
            forced,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The new value, if it has type `T`.
    #[must_use]
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Version of the cell after this change.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn source_module_id(&self) -> Option<&str> {
        self.source_module_id.as_deref()
    }

    /// Whether the write bypassed the equality check (forced write, forced
    /// notification, or in-place update).
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

impl fmt::Debug for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChange")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("source_module_id", &self.source_module_id)
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

/// Payload of the "action pulsed" class. Routed, never stored.
#[derive(Clone)]
pub struct ActionEnvelope {
    action: Rc<str>,
    payload: Rc<dyn Any>,
    source_module_id: Option<Rc<str>>,
    on_success: Option<Rc<dyn Fn()>>,
    on_error: Option<Rc<dyn Fn(&str)>>,
}

impl ActionEnvelope {
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    pub(crate) fn payload_rc(&self) -> &Rc<dyn Any> {
        &self.payload
    }

    #[must_use]
    pub fn source_module_id(&self) -> Option<&str> {
        self.source_module_id.as_deref()
    }

    /// Invoke the sender's success callback, if any.
    pub fn succeed(&self) {
        if let Some(cb) = &self.on_success {
            cb();
        }
    }

    /// Invoke the sender's error callback, if any.
    pub fn fail(&self, message: &str) {
        if let Some(cb) = &self.on_error {
            cb(message);
        }
    }
}

impl fmt::Debug for ActionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEnvelope")
            .field("action", &self.action)
            .field("source_module_id", &self.source_module_id)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Sender-side options for a pulse.
#[derive(Clone, Default)]
pub struct PulseOptions {
    pub source_module_id: Option<String>,
    pub on_success: Option<Rc<dyn Fn()>>,
    pub on_error: Option<Rc<dyn Fn(&str)>>,
}

impl PulseOptions {
    #[must_use]
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source_module_id: Some(source.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn on_success(mut self, callback: impl Fn() + 'static) -> Self {
        self.on_success = Some(Rc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&str) + 'static) -> Self {
        self.on_error = Some(Rc::new(callback));
        self
    }
}

impl fmt::Debug for PulseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulseOptions")
            .field("source_module_id", &self.source_module_id)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A typed action channel. The payload type is bound to the name once, when
/// the channel is first requested from the store.
pub struct Action<P> {
    name: Rc<str>,
    _payload: PhantomData<fn(P)>,
}

impl<P> Clone for Action<P> {
    fn clone(&self) -> Self {
        Self {
            name: Rc::clone(&self.name),
            _payload: PhantomData,
        }
    }
}

impl<P> fmt::Debug for Action<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("payload", &std::any::type_name::<P>())
            .finish()
    }
}

impl<P: 'static> Action<P> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn envelope(&self, payload: P, options: PulseOptions) -> ActionEnvelope {
        ActionEnvelope {
            action: Rc::clone(&self.name),
            payload: Rc::new(payload),
            source_module_id: options.source_module_id.map(Rc::from),
            on_success: options.on_success,
            on_error: options.on_error,
        }
    }
}

#[derive(Clone, Copy)]
struct ChannelBinding {
    type_id: TypeId,
    type_name: &'static str,
}

/// Both notification classes plus the action-name → payload-type bindings.
#[derive(Default)]
pub(crate) struct ActionBus {
    pub(crate) actions: ObserverList<ActionEnvelope>,
    pub(crate) states: ObserverList<StateChange>,
    channels: RefCell<AHashMap<Rc<str>, ChannelBinding>>,
}

impl ActionBus {
    pub(crate) fn channel<P: 'static>(&self, name: &str) -> Result<Action<P>> {
        let mut channels = self.channels.borrow_mut();
        if let Some((existing, binding)) = channels.get_key_value(name) {
            if binding.type_id != TypeId::of::<P>() {
                return Err(StoreError::type_conflict::<P>(name, binding.type_name));
            }
            return Ok(Action {
                name: Rc::clone(existing),
                _payload: PhantomData,
            });
        }
        let name: Rc<str> = Rc::from(name);
        channels.insert(
            Rc::clone(&name),
            ChannelBinding {
                type_id: TypeId::of::<P>(),
                type_name: std::any::type_name::<P>(),
            },
        );
        Ok(Action {
            name,
            _payload: PhantomData,
        })
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.borrow().len()
    }

    /// Drop every observer of both classes. Channel bindings survive so
    /// outstanding [`Action`] handles keep their payload type.
    pub(crate) fn clear_observers(&self) {
        self.actions.clear();
        self.states.clear();
    }
}
