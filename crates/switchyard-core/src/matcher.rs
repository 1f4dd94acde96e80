//! Call–request rendezvous for one method bucket.
//!
//! Each bucket (one per registered method, plus one for unregistered calls)
//! pairs incoming calls with waiting application requests. Calls queue FIFO in
//! a pending list guarded by the server's `mu_call`; requests queue LIFO in a
//! lock-free stack. The structures are deliberately asymmetric: the latest
//! request is dequeued first (warm consumer thread), while calls are served in
//! arrival order to bound head-of-line stalls. Every enqueue path attempts a
//! match first, so at most one of the two structures is non-empty at any
//! quiescent moment.

use std::sync::Arc;

use crate::call::{CallInner, CallState};
use crate::closure::ClosureList;
use crate::request::RcRef;
use crate::server::{CallQueues, Server};
use crate::stack::LockfreeStack;

/// Index of a matcher's pending queue inside the server's `mu_call` state.
/// Id 0 is the unregistered bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MatcherId(pub(crate) usize);

pub(crate) struct RequestMatcher {
    id: MatcherId,
    /// Slot ids of waiting application requests.
    requests: LockfreeStack,
}

impl RequestMatcher {
    pub(crate) fn new(id: MatcherId, entries: usize) -> Self {
        Self {
            id,
            requests: LockfreeStack::new(entries),
        }
    }

    /// A call has read its first metadata batch and resolved to this bucket.
    /// Match it against a waiting request, or park it pending.
    pub(crate) fn enqueue_call(&self, server: &Arc<Server>, calld: &Arc<CallInner>) {
        if let Some(slot) = self.requests.pop() {
            calld.set_state(CallState::Activated);
            server.begin_call(calld, slot);
        } else {
            let mut queues = server.lock_call_queues();
            calld.set_state(CallState::Pending);
            queues.queue_mut(self.id).push_back(Arc::clone(calld));
        }
    }

    /// An application request took slot `slot`. Push it, and if the push was
    /// the empty→non-empty transition this thread owns the match loop.
    pub(crate) fn enqueue_request(
        &self,
        server: &Arc<Server>,
        slot: u32,
        tasks: &mut ClosureList,
    ) {
        let mut slot = slot;
        while self.requests.push(slot) {
            match self.drain(server, tasks) {
                // The drain ended holding an unmatched slot (every remaining
                // pending call was a zombie); requeue it. Re-pushing may be a
                // fresh emptiness transition, so loop.
                Some(reclaimed) => slot = reclaimed,
                None => break,
            }
        }
    }

    /// Pair pending calls with waiting requests until either side runs dry.
    /// A popped slot is never dropped: if the head call turned out ZOMBIED,
    /// the slot is carried to the next head, and returned to the caller if
    /// the pending queue empties first.
    fn drain(&self, server: &Arc<Server>, tasks: &mut ClosureList) -> Option<u32> {
        let mut carried: Option<u32> = None;
        let mut queues = server.lock_call_queues();
        loop {
            if queues.queue_mut(self.id).is_empty() {
                break;
            }
            let slot = match carried.take().or_else(|| self.requests.pop()) {
                Some(slot) => slot,
                None => break,
            };
            let calld = queues
                .queue_mut(self.id)
                .pop_front()
                .expect("pending queue checked non-empty");
            drop(queues);

            let mut state = calld.lock_state();
            if *state == CallState::Zombied {
                drop(state);
                tasks.add(CallInner::kill_zombie_task(calld), true);
                carried = Some(slot);
            } else {
                assert_eq!(*state, CallState::Pending);
                *state = CallState::Activated;
                drop(state);
                server.begin_call(&calld, slot);
            }

            queues = server.lock_call_queues();
        }
        drop(queues);
        carried
    }

    /// Fail every waiting request in this bucket (shutdown drain).
    pub(crate) fn kill_requests(&self, server: &Arc<Server>) {
        while let Some(slot) = self.requests.pop() {
            server.fail_call(RcRef::Slot(slot));
        }
    }

    /// Zombify every pending call in this bucket. Caller holds `mu_call`.
    pub(crate) fn zombify_all_pending(&self, queues: &mut CallQueues, tasks: &mut ClosureList) {
        while let Some(calld) = queues.queue_mut(self.id).pop_front() {
            calld.set_state(CallState::Zombied);
            tasks.add(CallInner::kill_zombie_task(calld), true);
        }
    }
}

impl Drop for RequestMatcher {
    fn drop(&mut self) {
        debug_assert!(
            self.requests.pop().is_none(),
            "request matcher dropped with waiting requests"
        );
    }
}
