#![forbid(unsafe_code)]

//! Automatic dependency tracking.
//!
//! A tracked evaluation pushes a collecting frame onto the store's
//! [`WatcherContext`]. Every cell read while that frame is on top records
//! itself into the frame. When the evaluation finishes (or unwinds) the frame
//! is popped and the previously active frame resumes collecting.
//!
//! [`Watcher`] layers subscription management on top: after each tracked
//! evaluation it diffs the collected set against its current subscriptions,
//! unsubscribing cells no longer read and subscribing newly read ones. Cells
//! present in both sets are left alone.
//!
//! # Invariants
//!
//! 1. Reads are attributed only to the innermost active frame.
//! 2. The frame stack depth after an evaluation equals the depth before it,
//!    on every exit path.
//! 3. After `Watcher::track` returns, the watcher is subscribed to exactly
//!    the cells read during that evaluation.
//!
//! # Hazards
//!
//! An evaluation that reads an unbounded or externally randomized set of
//! cells never reaches a fixed point. Nothing here guards against that.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::{Rc, Weak};

use crate::cell::{CellId, ErasedCell, ListenerId};
use crate::delegate::Component;
use crate::error::panic_message;
use crate::store::{Store, WeakStore};

#[derive(Clone)]
struct Dependency {
    key: Rc<str>,
    cell: Weak<dyn ErasedCell>,
}

/// The set of cells read during one tracked evaluation, ordered by [`CellId`].
#[derive(Clone, Default)]
pub struct DependencySet {
    entries: BTreeMap<CellId, Dependency>,
}

impl DependencySet {
    fn insert(&mut self, cell: &Rc<dyn ErasedCell>) {
        self.entries.entry(cell.id()).or_insert_with(|| Dependency {
            key: Rc::clone(cell.key()),
            cell: Rc::downgrade(cell),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of the recorded cells, in cell-id order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.values().map(|dep| &*dep.key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.values().any(|dep| &*dep.key == key)
    }

    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.entries.keys().copied()
    }
}

impl fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

enum Frame {
    Collecting(DependencySet),
    Untracked,
}

/// Stack of active evaluation frames, owned by one store.
#[derive(Default)]
pub(crate) struct WatcherContext {
    frames: RefCell<Vec<Frame>>,
}

impl WatcherContext {
    /// Record `cell` into the innermost frame, if it is collecting.
    pub(crate) fn record(&self, cell: &Rc<dyn ErasedCell>) {
        if let Some(Frame::Collecting(deps)) = self.frames.borrow_mut().last_mut() {
            deps.insert(cell);
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        matches!(self.frames.borrow().last(), Some(Frame::Collecting(_)))
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub(crate) fn enter(&self) -> EvaluationScope<'_> {
        self.push(Frame::Collecting(DependencySet::default()))
    }

    pub(crate) fn enter_untracked(&self) -> EvaluationScope<'_> {
        self.push(Frame::Untracked)
    }

    fn push(&self, frame: Frame) -> EvaluationScope<'_> {
        let mut frames = self.frames.borrow_mut();
        frames.push(frame);
        EvaluationScope {
            ctx: self,
            depth: frames.len(),
            finished: false,
        }
    }
}

/// RAII guard for one frame. Dropping it without [`finish`](Self::finish)
/// (e.g. while unwinding) still restores the parent frame.
pub(crate) struct EvaluationScope<'a> {
    ctx: &'a WatcherContext,
    depth: usize,
    finished: bool,
}

impl EvaluationScope<'_> {
    /// Pop the frame and return what it collected.
    pub(crate) fn finish(mut self) -> DependencySet {
        self.finished = true;
        match self.pop() {
            Some(Frame::Collecting(deps)) => deps,
            _ => DependencySet::default(),
        }
    }

    fn pop(&self) -> Option<Frame> {
        let mut frames = self.ctx.frames.borrow_mut();
        // Frames above ours belong to scopes that leaked; drop them too.
        frames.truncate(self.depth);
        if frames.len() == self.depth {
            frames.pop()
        } else {
            None
        }
    }
}

impl Drop for EvaluationScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.pop();
        }
    }
}

struct Subscribed {
    key: Rc<str>,
    cell: Weak<dyn ErasedCell>,
    listener: ListenerId,
}

struct WatcherInner {
    store: WeakStore,
    on_change: Box<dyn Fn()>,
    subscriptions: RefCell<BTreeMap<CellId, Subscribed>>,
    evaluations: Cell<u64>,
}

impl WatcherInner {
    fn apply(self: &Rc<Self>, deps: DependencySet) {
        let mut subscriptions = self.subscriptions.borrow_mut();

        let stale: Vec<CellId> = subscriptions
            .keys()
            .filter(|id| !deps.contains(**id))
            .copied()
            .collect();
        for id in stale {
            let Some(sub) = subscriptions.remove(&id) else {
                continue;
            };
            if let Some(cell) = sub.cell.upgrade() {
                cell.unsubscribe(sub.listener);
            }
        }

        for (id, dep) in deps.entries {
            if subscriptions.contains_key(&id) {
                continue;
            }
            let Some(cell) = dep.cell.upgrade() else {
                continue;
            };
            let weak = Rc::downgrade(self);
            let listener = cell.subscribe_change(Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    (inner.on_change)();
                }
            }));
            subscriptions.insert(
                id,
                Subscribed {
                    key: dep.key,
                    cell: dep.cell,
                    listener,
                },
            );
        }
    }

    fn release(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for sub in subscriptions.into_values() {
            if let Some(cell) = sub.cell.upgrade() {
                cell.unsubscribe(sub.listener);
            }
        }
    }
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A consumer that re-subscribes itself to whatever it read last.
///
/// `on_change` is invoked whenever any currently subscribed cell changes. A
/// render host typically marks itself dirty there and calls
/// [`track`](Self::track) again when it rebuilds.
///
/// Dropping the last handle unsubscribes from every cell.
#[derive(Clone)]
pub struct Watcher {
    inner: Rc<WatcherInner>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("dependencies", &self.dependencies())
            .field("evaluations", &self.inner.evaluations.get())
            .finish()
    }
}

impl Watcher {
    pub fn new(store: &Store, on_change: impl Fn() + 'static) -> Self {
        Self {
            inner: Rc::new(WatcherInner {
                store: store.downgrade(),
                on_change: Box::new(on_change),
                subscriptions: RefCell::new(BTreeMap::new()),
                evaluations: Cell::new(0),
            }),
        }
    }

    /// Run `f` as a tracked evaluation and resubscribe to what it read.
    ///
    /// If `f` panics the previous subscriptions are kept and the panic
    /// propagates after the evaluation frame is restored.
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> R {
        let Some(store) = self.inner.store.upgrade() else {
            return f();
        };
        let (result, deps) = store.evaluate(f);
        self.inner.evaluations.set(self.inner.evaluations.get() + 1);
        self.inner.apply(deps);
        result
    }

    /// Keys this watcher is currently subscribed to, in cell-id order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .borrow()
            .values()
            .map(|sub| sub.key.to_string())
            .collect()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.borrow().len()
    }

    /// Number of completed tracked evaluations.
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.inner.evaluations.get()
    }

    /// Drop every subscription now instead of waiting for the handle to drop.
    pub fn dispose(&self) {
        self.inner.release();
    }
}

struct ReactionInner {
    watcher: Watcher,
    body: RefCell<Box<dyn FnMut()>>,
    running: Cell<bool>,
    pending: Cell<bool>,
    runs: Cell<u64>,
}

impl ReactionInner {
    fn run(&self) {
        if self.running.get() {
            // Re-triggered from inside our own evaluation; run again afterwards.
            self.pending.set(true);
            return;
        }
        self.running.set(true);
        loop {
            self.pending.set(false);
            self.runs.set(self.runs.get() + 1);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut guard = self.body.borrow_mut();
                let body: &mut dyn FnMut() = &mut **guard;
                self.watcher.track(body);
            }));
            if let Err(payload) = outcome {
                self.running.set(false);
                self.pending.set(false);
                match self.watcher.inner.store.upgrade() {
                    Some(store) => store.report_fault(
                        Component::Watcher,
                        None,
                        &format!("reaction panicked: {}", panic_message(&*payload)),
                    ),
                    None => resume_unwind(payload),
                }
                return;
            }
            if !self.pending.get() {
                break;
            }
        }
        self.running.set(false);
    }
}

/// A watcher whose change callback re-runs its own evaluation.
///
/// The body runs once immediately on creation. A panicking body is reported
/// through the delegate and keeps its previous subscriptions.
pub struct Reaction {
    inner: Rc<ReactionInner>,
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("dependencies", &self.inner.watcher.dependencies())
            .field("runs", &self.inner.runs.get())
            .finish()
    }
}

impl Reaction {
    pub fn new(store: &Store, body: impl FnMut() + 'static) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ReactionInner>| {
            let weak = weak.clone();
            ReactionInner {
                watcher: Watcher::new(store, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.run();
                    }
                }),
                body: RefCell::new(Box::new(body)),
                running: Cell::new(false),
                pending: Cell::new(false),
                runs: Cell::new(0),
            }
        });
        inner.run();
        Self { inner }
    }

    /// Number of times the body has run, including the initial run.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.inner.runs.get()
    }

    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.inner.watcher.dependencies()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.watcher.subscription_count()
    }

    /// Stop reacting. Equivalent to dropping the handle.
    pub fn dispose(&self) {
        self.inner.watcher.dispose();
    }
}
