//! Per-conversion execution limits.
//!
//! The template engine cannot be interrupted from outside, so every loop over
//! input data (and every `range(...)`, include expansion and helper call)
//! polls an [`ExecutionGuard`]. Once the guard trips, iterators end early and helpers
//! fail, which unwinds the render quickly; the pipeline then reports the
//! interruption instead of whatever the engine returned.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use minijinja::{Error, ErrorKind};

use crate::error::RenderError;

const RUNNING: u8 = 0;
const TIMED_OUT: u8 = 1;
const ITERATIONS_EXHAUSTED: u8 = 2;

/// Reason a render was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Timeout,
    IterationLimit,
}

/// Deadline and iteration budget for one conversion.
///
/// Owned by a single conversion; the atomics only exist so template objects,
/// which must be `Send + Sync`, can share it.
#[derive(Debug)]
pub struct ExecutionGuard {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    max_iterations: u64,
    iterations: AtomicU64,
    state: AtomicU8,
    entered: AtomicBool,
}

impl ExecutionGuard {
    /// Create a guard. `max_iterations == 0` means no iteration cap.
    pub fn new(timeout: Option<Duration>, max_iterations: u64) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            max_iterations,
            iterations: AtomicU64::new(0),
            state: AtomicU8::new(RUNNING),
            entered: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, 0)
    }

    /// Account for one loop iteration. Returns `false` when the loop must stop.
    pub fn tick(&self) -> bool {
        if self.interrupted().is_some() {
            return false;
        }
        let count = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_iterations > 0 && count > self.max_iterations {
            self.trip(ITERATIONS_EXHAUSTED);
            return false;
        }
        self.poll_deadline()
    }

    /// Check the deadline without consuming iteration budget.
    pub fn poll_deadline(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.trip(TIMED_OUT);
            }
        }
        self.interrupted().is_none()
    }

    /// Engine-facing variant of [`poll_deadline`](Self::poll_deadline).
    pub fn check(&self) -> Result<(), Error> {
        if self.poll_deadline() {
            return Ok(());
        }
        Err(self.interruption_error())
    }

    /// Account for one template being entered.
    ///
    /// The first entry is the root template and only polls the deadline.
    /// Every later one is an include (or import/extends) expansion and costs
    /// one iteration, so self-inclusion is bounded by the iteration cap.
    pub fn enter_template(&self) -> Result<(), Error> {
        let proceed = if self.entered.swap(true, Ordering::AcqRel) {
            self.tick()
        } else {
            self.poll_deadline()
        };
        if proceed {
            Ok(())
        } else {
            Err(self.interruption_error())
        }
    }

    fn interruption_error(&self) -> Error {
        let reason = match self.interrupted() {
            Some(Interruption::IterationLimit) => "iteration limit reached",
            _ => "deadline elapsed",
        };
        Error::new(
            ErrorKind::InvalidOperation,
            format!("conversion interrupted: {reason}"),
        )
    }

    pub fn interrupted(&self) -> Option<Interruption> {
        match self.state.load(Ordering::Acquire) {
            TIMED_OUT => Some(Interruption::Timeout),
            ITERATIONS_EXHAUSTED => Some(Interruption::IterationLimit),
            _ => None,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn max_iterations(&self) -> u64 {
        self.max_iterations
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The render error matching the interruption, if any.
    pub fn render_error(&self) -> Option<RenderError> {
        self.interrupted().map(|reason| match reason {
            Interruption::Timeout => RenderError::Timeout {
                limit_ms: self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            },
            Interruption::IterationLimit => RenderError::IterationLimit {
                limit: self.max_iterations,
            },
        })
    }

    fn trip(&self, reason: u8) {
        // First reason wins.
        let _ = self
            .state
            .compare_exchange(RUNNING, reason, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Iterator adapter charging one guard tick per yielded item.
pub struct GuardedIter<I> {
    inner: I,
    guard: Arc<ExecutionGuard>,
}

impl<I> GuardedIter<I> {
    pub fn new(inner: I, guard: Arc<ExecutionGuard>) -> Self {
        Self { inner, guard }
    }
}

impl<I: Iterator> Iterator for GuardedIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if self.guard.tick() {
            Some(item)
        } else {
            None
        }
    }
}
