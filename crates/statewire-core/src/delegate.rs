#![forbid(unsafe_code)]

//! The seam between the runtime and its host.
//!
//! The core calls out through [`Delegate`] for logging, cross-module write
//! auditing, and action transport. It never names a concrete transport.
//!
//! [`TracingDelegate`] is the default: log lines go to `tracing`, and the
//! transport is a local loopback so `Delegate::subscribe` receives whatever
//! `Delegate::pulse` sends.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::error::panic_message;

/// Runtime component a log line originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Registry,
    Watcher,
    Bus,
    Computed,
    Persistence,
}

impl Component {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Watcher => "watcher",
            Self::Bus => "bus",
            Self::Computed => "computed",
            Self::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context attached to a delegate log call.
#[derive(Debug, Clone, Copy)]
pub struct LogContext<'a> {
    pub component: Component,
    pub key: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    #[must_use]
    pub const fn new(component: Component) -> Self {
        Self {
            component,
            key: None,
        }
    }

    #[must_use]
    pub const fn with_key(mut self, key: &'a str) -> Self {
        self.key = Some(key);
        self
    }
}

/// Kind of a cross-module interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    /// A module wrote a key in another module's namespace.
    Write,
    /// A module re-broadcast a key in another module's namespace.
    ForceNotify,
}

impl InteractionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::ForceNotify => "force_notify",
        }
    }
}

/// Callback type used by host-side delivery.
pub type HostCallback = Rc<dyn Fn(&Rc<dyn Any>)>;

/// RAII handle for a host-side subscription. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the subscription alive for the lifetime of the transport.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Capabilities the runtime requires from its host.
pub trait Delegate {
    fn log(&self, message: &str, context: &LogContext<'_>, is_error: bool);

    fn record_interaction(
        &self,
        source_id: &str,
        target_id: &str,
        kind: InteractionKind,
        detail: &str,
    );

    fn pulse(&self, action: &str, payload: &Rc<dyn Any>, source_id: Option<&str>);

    fn subscribe(&self, action: &str, callback: HostCallback) -> SubscriptionHandle;
}

type HostSubscribers = RefCell<Vec<(u64, Rc<str>, HostCallback)>>;

/// Loopback transport shared by the bundled delegates.
#[derive(Default)]
pub(crate) struct Loopback {
    next_id: Cell<u64>,
    subscribers: Rc<HostSubscribers>,
}

impl Loopback {
    pub(crate) fn deliver(&self, action: &str, payload: &Rc<dyn Any>) -> usize {
        let targets: Vec<HostCallback> = self
            .subscribers
            .borrow()
            .iter()
            .filter(|(_, name, _)| &**name == action)
            .map(|(_, _, cb)| Rc::clone(cb))
            .collect();
        for cb in &targets {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(payload))) {
                tracing::error!(
                    component = "bus",
                    key = action,
                    "host subscriber panicked: {}",
                    panic_message(&*panic)
                );
            }
        }
        targets.len()
    }

    pub(crate) fn subscribe(&self, action: &str, callback: HostCallback) -> SubscriptionHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.subscribers
            .borrow_mut()
            .push((id, Rc::from(action), callback));
        let weak: Weak<HostSubscribers> = Rc::downgrade(&self.subscribers);
        SubscriptionHandle::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                subscribers.borrow_mut().retain(|(existing, _, _)| *existing != id);
            }
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }
}

/// Default delegate: `tracing` for logs and audits, loopback for transport.
#[derive(Default)]
pub struct TracingDelegate {
    loopback: Loopback,
}

impl TracingDelegate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live host-side subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.loopback.len()
    }
}

impl fmt::Debug for TracingDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingDelegate")
            .field("subscribers", &self.loopback.len())
            .finish()
    }
}

impl Delegate for TracingDelegate {
    fn log(&self, message: &str, context: &LogContext<'_>, is_error: bool) {
        let component = context.component.as_str();
        let key = context.key.unwrap_or("");
        if is_error {
            tracing::error!(component, key, "{message}");
        } else {
            tracing::debug!(component, key, "{message}");
        }
    }

    fn record_interaction(
        &self,
        source_id: &str,
        target_id: &str,
        kind: InteractionKind,
        detail: &str,
    ) {
        tracing::debug!(
            source_module = source_id,
            target_module = target_id,
            kind = kind.as_str(),
            detail,
            "cross-module interaction"
        );
    }

    fn pulse(&self, action: &str, payload: &Rc<dyn Any>, source_id: Option<&str>) {
        let delivered = self.loopback.deliver(action, payload);
        tracing::trace!(action, source_module = source_id.unwrap_or(""), delivered, "pulse");
    }

    fn subscribe(&self, action: &str, callback: HostCallback) -> SubscriptionHandle {
        self.loopback.subscribe(action, callback)
    }
}

/// One captured [`Delegate::log`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub message: String,
    pub component: Component,
    pub key: Option<String>,
    pub is_error: bool,
}

/// One captured [`Delegate::record_interaction`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionRecord {
    pub source_id: String,
    pub target_id: String,
    pub kind: InteractionKind,
    pub detail: String,
}

/// Delegate that keeps every call in memory, for tests and debug tooling.
///
/// Transport behaves like [`TracingDelegate`]'s loopback.
#[derive(Default)]
pub struct RecordingDelegate {
    logs: RefCell<Vec<LogRecord>>,
    interactions: RefCell<Vec<InteractionRecord>>,
    pulses: RefCell<Vec<(String, Option<String>)>>,
    loopback: Loopback,
}

impl RecordingDelegate {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.borrow().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<LogRecord> {
        self.logs
            .borrow()
            .iter()
            .filter(|r| r.is_error)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn interactions(&self) -> Vec<InteractionRecord> {
        self.interactions.borrow().clone()
    }

    /// `(action, source)` pairs in pulse order.
    #[must_use]
    pub fn pulses(&self) -> Vec<(String, Option<String>)> {
        self.pulses.borrow().clone()
    }

    pub fn clear(&self) {
        self.logs.borrow_mut().clear();
        self.interactions.borrow_mut().clear();
        self.pulses.borrow_mut().clear();
    }
}

impl fmt::Debug for RecordingDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingDelegate")
            .field("logs", &self.logs.borrow().len())
            .field("interactions", &self.interactions.borrow().len())
            .field("pulses", &self.pulses.borrow().len())
            .finish()
    }
}

impl Delegate for RecordingDelegate {
    fn log(&self, message: &str, context: &LogContext<'_>, is_error: bool) {
        self.logs.borrow_mut().push(LogRecord {
            message: message.to_owned(),
            component: context.component,
            key: context.key.map(str::to_owned),
            is_error,
        });
    }

    fn record_interaction(
        &self,
        source_id: &str,
        target_id: &str,
        kind: InteractionKind,
        detail: &str,
    ) {
        self.interactions.borrow_mut().push(InteractionRecord {
            source_id: source_id.to_owned(),
            target_id: target_id.to_owned(),
            kind,
            detail: detail.to_owned(),
        });
    }

    fn pulse(&self, action: &str, payload: &Rc<dyn Any>, source_id: Option<&str>) {
        self.pulses
            .borrow_mut()
            .push((action.to_owned(), source_id.map(str::to_owned)));
        self.loopback.deliver(action, payload);
    }

    fn subscribe(&self, action: &str, callback: HostCallback) -> SubscriptionHandle {
        self.loopback.subscribe(action, callback)
    }
}
