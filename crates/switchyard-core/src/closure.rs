//! Deferred-task batching.
//!
//! Entry points into the core gather work produced under locks (zombie kills,
//! channel finalizers, completion posts) on a [`ClosureList`] and drain it
//! after every lock has been released. Tasks may themselves enqueue more
//! tasks; the drain keeps going until the list is empty. This keeps lock
//! scope small and lets callbacks re-acquire server locks without deadlock.

use std::collections::VecDeque;

/// A deferred task. Invoked once with a success flag and the list it was
/// drained from, so it can schedule follow-up work.
pub type Closure = Box<dyn FnOnce(bool, &mut ClosureList) + Send>;

/// Wrap a callback as a [`Closure`].
pub fn closure<F>(f: F) -> Closure
where
    F: FnOnce(bool, &mut ClosureList) + Send + 'static,
{
    Box::new(f)
}

/// An ordered batch of deferred tasks.
#[derive(Default)]
pub struct ClosureList {
    items: VecDeque<(Closure, bool)>,
}

impl ClosureList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to run with the given success flag.
    pub fn add(&mut self, task: Closure, success: bool) {
        self.items.push_back((task, success));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain the list in FIFO order. Tasks appended while draining run in the
    /// same pass. Callers must not hold any server lock here.
    pub fn run(&mut self) {
        while let Some((task, success)) = self.items.pop_front() {
            task(success, self);
        }
    }
}
