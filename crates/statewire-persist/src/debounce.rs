#![forbid(unsafe_code)]

//! Trailing-edge debounce with an injectable clock.
//!
//! # Invariants
//!
//! 1. Every [`schedule`](Debouncer::schedule) cancels the pending deadline and
//!    sets a new one a full window later.
//! 2. [`poll`](Debouncer::poll) returns `true` at most once per scheduled
//!    deadline, and only once the deadline has passed.

use std::cell::Cell;
use std::rc::Rc;

use web_time::{Duration, Instant};

/// Time source for [`Debouncer`].
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Clones share the same offset.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset.set(self.offset.get() + delta);
    }

    /// Time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + self.offset.get()
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer<C: Clock = SystemClock> {
    clock: C,
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer<SystemClock> {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, SystemClock)
    }
}

impl<C: Clock> Debouncer<C> {
    #[must_use]
    pub fn with_clock(window: Duration, clock: C) -> Self {
        Self {
            clock,
            window,
            deadline: None,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Cancel any pending deadline and start a fresh window.
    pub fn schedule(&mut self) {
        self.deadline = Some(self.clock.now() + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the pending deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(self.clock.now()))
    }

    /// Fire if the deadline has passed. Clears the deadline when firing.
    pub fn poll(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    fn debouncer() -> (Debouncer<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (Debouncer::with_clock(WINDOW, clock.clone()), clock)
    }

    #[test]
    fn fires_once_after_window() {
        let (mut d, clock) = debouncer();
        assert!(!d.poll());
        d.schedule();
        clock.advance(Duration::from_millis(499));
        assert!(!d.poll());
        clock.advance(Duration::from_millis(1));
        assert!(d.poll());
        assert!(!d.poll());
        assert!(!d.is_pending());
    }

    #[test]
    fn reschedule_pushes_deadline() {
        let (mut d, clock) = debouncer();
        d.schedule();
        for _ in 0..5 {
            clock.advance(Duration::from_millis(300));
            d.schedule();
            assert!(!d.poll());
        }
        assert_eq!(d.remaining(), Some(WINDOW));
        clock.advance(WINDOW);
        assert!(d.poll());
    }

    #[test]
    fn cancel_clears() {
        let (mut d, clock) = debouncer();
        d.schedule();
        d.cancel();
        clock.advance(WINDOW * 2);
        assert!(!d.poll());
        assert_eq!(d.remaining(), None);
    }
}
