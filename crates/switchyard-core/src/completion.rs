//! Completion queues and pollset tokens.
//!
//! The core posts work results to completion queues: a matched or failed
//! request, a finished shutdown. Each post carries a done callback that runs
//! when the application consumes the event; the server uses it to return the
//! request slot to the free-list and to release its reference. Consumption is
//! the synchronous analogue of a response waiter: a condvar-guarded queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::closure::{Closure, ClosureList};

/// An application-visible tag identifying one submitted operation.
pub type Tag = u64;

/// The event handed to the application by [`CompletionQueue::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub tag: Tag,
    pub success: bool,
}

/// Opaque polling token. The server materializes one per registered queue and
/// hands the set to listeners at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pollset(usize);

static NEXT_POLLSET: AtomicUsize = AtomicUsize::new(0);

struct Posted {
    tag: Tag,
    success: bool,
    done: Closure,
}

#[derive(Default)]
struct CqState {
    queue: VecDeque<Posted>,
    /// Operations begun and not yet delivered; diagnostics only.
    outstanding: usize,
}

/// A completion queue.
pub struct CompletionQueue {
    state: Mutex<CqState>,
    ready: Condvar,
    server_cq: AtomicBool,
    pollset: Pollset,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CqState::default()),
            ready: Condvar::new(),
            server_cq: AtomicBool::new(false),
            pollset: Pollset(NEXT_POLLSET.fetch_add(1, Ordering::Relaxed)),
        })
    }

    pub fn pollset(&self) -> Pollset {
        self.pollset.clone()
    }

    /// Mark this queue as registered with a server. Idempotent.
    pub(crate) fn mark_server_cq(&self) {
        self.server_cq.store(true, Ordering::Release);
    }

    pub fn is_server_cq(&self) -> bool {
        self.server_cq.load(Ordering::Acquire)
    }

    /// Record that a completion will eventually be posted.
    pub fn begin_op(&self) {
        self.state.lock().outstanding += 1;
    }

    /// Post a completion. `done` runs when the application consumes it.
    pub fn end_op(&self, tag: Tag, success: bool, done: Closure) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.queue.push_back(Posted { tag, success, done });
        drop(state);
        self.ready.notify_one();
    }

    /// Block for the next event, up to `timeout`. Consuming the event runs
    /// its done callback (and any work that callback schedules).
    pub fn next(&self, timeout: Duration) -> Option<CompletionEvent> {
        let deadline = Instant::now() + timeout;
        let posted = {
            let mut state = self.state.lock();
            loop {
                if let Some(posted) = state.queue.pop_front() {
                    break posted;
                }
                if self.ready.wait_until(&mut state, deadline).timed_out() {
                    return None;
                }
            }
        };
        let event = CompletionEvent {
            tag: posted.tag,
            success: posted.success,
        };
        let mut tasks = ClosureList::new();
        tasks.add(posted.done, event.success);
        tasks.run();
        Some(event)
    }

    /// Number of begun-but-undelivered operations; diagnostics only.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::closure;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn post_then_next() {
        let cq = CompletionQueue::new();
        cq.begin_op();
        cq.end_op(7, true, closure(|_, _| {}));
        let ev = cq.next(Duration::from_millis(100)).unwrap();
        assert_eq!(ev, CompletionEvent { tag: 7, success: true });
        assert_eq!(cq.outstanding(), 0);
    }

    #[test]
    fn next_times_out_when_empty() {
        let cq = CompletionQueue::new();
        assert!(cq.next(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn done_runs_on_consume_not_on_post() {
        let cq = CompletionQueue::new();
        let ran = Arc::new(StdAtomicBool::new(false));
        let flag = Arc::clone(&ran);
        cq.begin_op();
        cq.end_op(
            1,
            false,
            closure(move |success, _| {
                assert!(!success);
                flag.store(true, Ordering::SeqCst);
            }),
        );
        assert!(!ran.load(Ordering::SeqCst));
        cq.next(Duration::from_millis(100)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn server_cq_marking_is_idempotent() {
        let cq = CompletionQueue::new();
        assert!(!cq.is_server_cq());
        cq.mark_server_cq();
        cq.mark_server_cq();
        assert!(cq.is_server_cq());
    }

    #[test]
    fn events_delivered_in_post_order() {
        let cq = CompletionQueue::new();
        for tag in 0..4 {
            cq.begin_op();
            cq.end_op(tag, true, closure(|_, _| {}));
        }
        for tag in 0..4 {
            assert_eq!(cq.next(Duration::from_millis(100)).unwrap().tag, tag);
        }
    }
}
