//! Per-call state and the server-side receive interception.
//!
//! When the call layer issues a receive on a freshly accepted stream, the
//! server surface records the higher-layer completion callback and substitutes
//! its own. On each receive completion it interprets the first metadata batch
//! (extracting `:path`, `:authority`, and the deadline by interned-key
//! identity), watches the stream state for closure, and then delegates to the
//! captured callback with the original success value.
//!
//! State machine:
//!
//! ```text
//! NOT_STARTED --first metadata, request waiting--> ACTIVATED
//! NOT_STARTED --first metadata, no request------> PENDING
//! NOT_STARTED --shutdown / RECV_CLOSED / CLOSED-> ZOMBIED
//! PENDING ------matched by a request-----------> ACTIVATED
//! PENDING ------stream CLOSED------------------> ZOMBIED   (stays queued;
//!                                                dropped at dequeue)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::channel::Connection;
use crate::closure::{closure, Closure, ClosureList};
use crate::completion::CompletionQueue;
use crate::metadata::{MdStr, MetadataArray};
use crate::transport::{RecvOp, StreamOp, StreamState, StreamStateCell, TransportStreamOp};

/// The lifecycle of one server-side call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for the first metadata batch.
    NotStarted,
    /// First metadata read; parked in a matcher's pending queue.
    Pending,
    /// Matched with an application request.
    Activated,
    /// Cancelled before activation; awaits its kill task.
    Zombied,
}

/// Result of asking a call for its first message payload.
pub(crate) enum MessageOutcome {
    /// Payload (or definitive absence, after half-close) available now.
    Ready(Option<Bytes>),
    /// Nothing buffered yet; the request slot parks until delivery.
    Parked,
}

struct RecvState {
    path: Option<MdStr>,
    host: Option<MdStr>,
    deadline: Option<SystemTime>,
    got_initial_metadata: bool,
    /// Headers kept after `:path`/`:authority` extraction, published to the
    /// application with the matched request.
    captured_metadata: MetadataArray,
    /// Message payloads buffered for a later RECV_MESSAGE request.
    messages: VecDeque<Bytes>,
    /// No more incoming data (RECV_CLOSED or CLOSED observed).
    recv_closed: bool,
    /// A registered request waiting for the first message payload.
    parked_slot: Option<u32>,
    ops: Arc<Mutex<Vec<StreamOp>>>,
    stream_state: Arc<StreamStateCell>,
    on_done_recv: Option<Closure>,
    cq_bound: Option<Arc<CompletionQueue>>,
}

pub(crate) struct CallInner {
    channel: Arc<Connection>,
    stream_id: u64,
    /// `mu_state`: guards only the state field; taken with no other lock held
    /// except briefly inside `mu_call` on the enqueue/dequeue paths.
    state: Mutex<CallState>,
    recv: Mutex<RecvState>,
    destroyed: AtomicBool,
}

impl CallInner {
    pub(crate) fn set_state(&self, state: CallState) {
        *self.state.lock() = state;
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock()
    }

    pub(crate) fn bind_completion_queue(&self, cq: Arc<CompletionQueue>) {
        self.recv.lock().cq_bound = Some(cq);
    }

    /// Batch publication: method, host, deadline, and the kept headers.
    pub(crate) fn take_batch_details(
        &self,
    ) -> (String, String, Option<SystemTime>, MetadataArray) {
        let mut recv = self.recv.lock();
        let path = recv.path.as_ref().expect("batch call has a path");
        let host = recv.host.as_ref().expect("batch call has a host");
        let method = path.as_str().to_owned();
        let host = host.as_str().to_owned();
        let deadline = recv.deadline;
        let metadata = std::mem::take(&mut recv.captured_metadata);
        (method, host, deadline, metadata)
    }

    /// Registered publication: deadline and the kept headers (the caller
    /// already knows the method).
    pub(crate) fn take_registered_details(&self) -> (Option<SystemTime>, MetadataArray) {
        let mut recv = self.recv.lock();
        let deadline = recv.deadline;
        let metadata = std::mem::take(&mut recv.captured_metadata);
        (deadline, metadata)
    }

    /// Hand over the first buffered message, report closure, or park `slot`.
    pub(crate) fn take_message_or_park(&self, slot: u32) -> MessageOutcome {
        let mut recv = self.recv.lock();
        if let Some(payload) = recv.messages.pop_front() {
            MessageOutcome::Ready(Some(payload))
        } else if recv.recv_closed {
            MessageOutcome::Ready(None)
        } else {
            recv.parked_slot = Some(slot);
            MessageOutcome::Parked
        }
    }

    /// The deferred destroy for a zombified call.
    pub(crate) fn kill_zombie_task(calld: Arc<CallInner>) -> Closure {
        closure(move |_, _| calld.destroy())
    }

    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        assert_ne!(
            *self.state.lock(),
            CallState::Pending,
            "call destroyed while still pending in a matcher"
        );
        {
            let mut recv = self.recv.lock();
            recv.path = None;
            recv.host = None;
            recv.captured_metadata.clear();
            recv.messages.clear();
            recv.on_done_recv = None;
            recv.cq_bound = None;
            recv.parked_slot = None;
        }
        self.channel.for_each_elem(|elem| elem.destroy_call_elem());
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Issue the next receive down the stack. The higher-layer callback here
    /// is the call layer's re-arm: it keeps the stream receiving until it
    /// closes or the call dies.
    fn start_receive(self: &Arc<Self>, tasks: &mut ClosureList) {
        let weak = Arc::downgrade(self);
        let rearm = closure(move |success: bool, tasks: &mut ClosureList| {
            if !success {
                return;
            }
            let Some(call) = weak.upgrade() else { return };
            if call.is_destroyed() {
                return;
            }
            let state = call.recv.lock().stream_state.get();
            if matches!(state, StreamState::Open | StreamState::SendClosed) {
                call.start_receive(tasks);
            }
        });
        let (ops, state) = {
            let recv = self.recv.lock();
            (Arc::clone(&recv.ops), Arc::clone(&recv.stream_state))
        };
        self.start_transport_stream_op(
            TransportStreamOp {
                recv: Some(RecvOp {
                    ops,
                    state,
                    on_done: rearm,
                }),
            },
            tasks,
        );
    }

    /// The surface's op hook: substitute our completion callback for the
    /// higher layer's on the receive half, then forward down the stack.
    pub(crate) fn start_transport_stream_op(
        self: &Arc<Self>,
        mut op: TransportStreamOp,
        tasks: &mut ClosureList,
    ) {
        if let Some(recv_op) = op.recv.take() {
            let (ops, state) = (Arc::clone(&recv_op.ops), Arc::clone(&recv_op.state));
            {
                let mut recv = self.recv.lock();
                recv.ops = recv_op.ops;
                recv.stream_state = recv_op.state;
                recv.on_done_recv = Some(recv_op.on_done);
            }
            let me = Arc::clone(self);
            op.recv = Some(RecvOp {
                ops,
                state,
                on_done: closure(move |success, tasks| me.server_on_recv(success, tasks)),
            });
        }
        self.channel
            .for_each_elem(|elem| elem.start_transport_stream_op(&mut op));
        self.channel.start_stream_op(self.stream_id, op, tasks);
    }

    /// Receive-completion interception.
    fn server_on_recv(self: &Arc<Self>, success: bool, tasks: &mut ClosureList) {
        let mut start_rpc = false;
        let mut parked_delivery: Option<(u32, Option<Bytes>)> = None;

        if success {
            let (path_key, authority_key) = self.channel.keys();
            let mut recv = self.recv.lock();
            let drained: Vec<StreamOp> = recv.ops.lock().drain(..).collect();
            for stream_op in drained {
                match stream_op {
                    StreamOp::Metadata(batch) if !recv.got_initial_metadata => {
                        if let Some(deadline) = batch.deadline {
                            recv.deadline = Some(deadline);
                        }
                        for md in batch.list {
                            if md.key.same(&path_key) {
                                recv.path = Some(md.value);
                            } else if md.key.same(&authority_key) {
                                recv.host = Some(md.value);
                            } else {
                                recv.captured_metadata.entries.push(md);
                            }
                        }
                        if recv.path.is_some() && recv.host.is_some() {
                            recv.got_initial_metadata = true;
                            start_rpc = true;
                        }
                    }
                    // trailing metadata is not ours to interpret
                    StreamOp::Metadata(_) => {}
                    StreamOp::Message(payload) => recv.messages.push_back(payload),
                }
            }
            if recv.parked_slot.is_some() && !recv.messages.is_empty() {
                let slot = recv.parked_slot.take().expect("parked slot checked");
                let payload = recv.messages.pop_front();
                parked_delivery = Some((slot, payload));
            }
        }

        if start_rpc {
            self.start_new_rpc(tasks);
        }

        let stream_state = self.recv.lock().stream_state.get();
        match stream_state {
            StreamState::Open | StreamState::SendClosed => {}
            StreamState::RecvClosed => {
                self.note_recv_closed(&mut parked_delivery);
                let mut state = self.state.lock();
                if *state == CallState::NotStarted {
                    *state = CallState::Zombied;
                    drop(state);
                    tasks.add(Self::kill_zombie_task(Arc::clone(self)), true);
                }
            }
            StreamState::Closed => {
                self.note_recv_closed(&mut parked_delivery);
                let mut state = self.state.lock();
                match *state {
                    CallState::NotStarted => {
                        *state = CallState::Zombied;
                        drop(state);
                        tasks.add(Self::kill_zombie_task(Arc::clone(self)), true);
                    }
                    CallState::Pending => {
                        // Stays linked in the matcher; the dequeue path will
                        // observe ZOMBIED and drop it.
                        *state = CallState::Zombied;
                    }
                    _ => {}
                }
            }
        }

        if let Some((slot, payload)) = parked_delivery {
            self.channel.server().complete_parked(slot, payload);
        }

        // Always delegate to the captured higher-layer callback with the
        // original success value.
        let higher = self.recv.lock().on_done_recv.take();
        if let Some(on_done) = higher {
            on_done(success, tasks);
        }
    }

    fn note_recv_closed(&self, parked_delivery: &mut Option<(u32, Option<Bytes>)>) {
        let mut recv = self.recv.lock();
        recv.recv_closed = true;
        if parked_delivery.is_none() {
            if let Some(slot) = recv.parked_slot.take() {
                let payload = recv.messages.pop_front();
                *parked_delivery = Some((slot, payload));
            }
        }
    }

    /// First metadata complete: route the call to its matcher, or zombify it
    /// if the server is shutting down.
    fn start_new_rpc(self: &Arc<Self>, tasks: &mut ClosureList) {
        let server = self.channel.server();
        if server.is_shutdown() {
            self.set_state(CallState::Zombied);
            tasks.add(Self::kill_zombie_task(Arc::clone(self)), true);
            return;
        }
        let (path, host) = {
            let recv = self.recv.lock();
            (
                recv.path.clone().expect("path set before start_new_rpc"),
                recv.host.clone().expect("host set before start_new_rpc"),
            )
        };
        match self.channel.lookup_registered(&host, &path) {
            Some(rm) => rm.matcher().enqueue_call(server, self),
            None => server.unregistered_matcher().enqueue_call(server, self),
        }
    }
}

/// An accepted server-side call. Cheap to clone; published to the application
/// through the request outputs once matched.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    /// Create the per-call state for a freshly accepted stream and issue the
    /// initial (wrapped) receive.
    pub(crate) fn create(channel: &Arc<Connection>, stream_id: u64) -> Call {
        let inner = Arc::new(CallInner {
            channel: Arc::clone(channel),
            stream_id,
            state: Mutex::new(CallState::NotStarted),
            recv: Mutex::new(RecvState {
                path: None,
                host: None,
                deadline: None,
                got_initial_metadata: false,
                captured_metadata: MetadataArray::default(),
                messages: VecDeque::new(),
                recv_closed: false,
                parked_slot: None,
                ops: Arc::new(Mutex::new(Vec::new())),
                stream_state: StreamStateCell::new(),
                on_done_recv: None,
                cq_bound: None,
            }),
            destroyed: AtomicBool::new(false),
        });
        channel.for_each_elem(|elem| elem.init_call_elem());
        let mut tasks = ClosureList::new();
        inner.start_receive(&mut tasks);
        tasks.run();
        Call { inner }
    }

    pub(crate) fn from_inner(inner: Arc<CallInner>) -> Call {
        Call { inner }
    }

    pub fn stream_id(&self) -> u64 {
        self.inner.stream_id
    }

    /// Current state; diagnostics.
    pub fn state(&self) -> CallState {
        *self.inner.state.lock()
    }

    /// The `:path` from the first metadata batch, once read.
    pub fn method(&self) -> Option<String> {
        self.inner.recv.lock().path.as_ref().map(|p| p.as_str().to_owned())
    }

    /// The `:authority` from the first metadata batch, once read.
    pub fn host(&self) -> Option<String> {
        self.inner.recv.lock().host.as_ref().map(|h| h.as_str().to_owned())
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.inner.recv.lock().deadline
    }

    /// The queue this call was bound to when it was matched.
    pub fn completion_queue(&self) -> Option<Arc<CompletionQueue>> {
        self.inner.recv.lock().cq_bound.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Tear the call down once the application is finished with it.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Send a per-stream op down the stack (receive halves are wrapped by the
    /// server surface).
    pub fn start_transport_stream_op(&self, op: TransportStreamOp, tasks: &mut ClosureList) {
        self.inner.start_transport_stream_op(op, tasks);
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("stream_id", &self.inner.stream_id)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}
