//! Test doubles for driving switchyard-core without a real transport.
//!
//! [`MockTransport`] records every connection-level op the server emits and
//! plays the transport's side of the stream contract: it owns the
//! accept-stream wiring, arms receive ops, and lets tests deliver metadata,
//! messages, and stream-state changes. [`MockListener`] records the
//! start/destroy lifecycle and invokes its destroy callback exactly once.
//!
//! Scenario tests for the server live in this crate's `tests/` directory;
//! keeping them here avoids a circular dev-dependency with the core.

#![forbid(unsafe_op_in_unsafe_fn)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use switchyard_core::{
    AcceptStreamFn, Call, Closure, ClosureList, ConnectivityFn, ConnectivityState, Listener,
    MetadataBatch, MetadataContext, Pollset, RecvOp, Server, StreamOp, StreamState, Transport,
    TransportOp, TransportStreamOp,
};

#[derive(Default)]
struct MockState {
    accept: Option<AcceptStreamFn>,
    connectivity: Option<ConnectivityFn>,
    bound_pollsets: Vec<Pollset>,
    goaway_messages: Vec<Bytes>,
    disconnects: usize,
    streams: HashMap<u64, RecvOp>,
    next_stream_id: u64,
}

/// An in-memory transport double.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept a new incoming stream through the server's wired callback,
    /// returning the call the server created for it.
    pub fn accept_stream(&self) -> Call {
        let (accept, stream_id) = {
            let mut state = self.state.lock();
            let accept = state
                .accept
                .clone()
                .expect("accept_stream wired by setup_transport");
            let stream_id = state.next_stream_id;
            state.next_stream_id += 1;
            (accept, stream_id)
        };
        // invoked without the mock lock held: creating the call re-enters
        // start_stream_op to arm the initial receive
        accept(stream_id)
    }

    /// Complete the armed receive on `call` with `ops` and the new stream
    /// state, reporting success.
    pub fn deliver(&self, call: &Call, ops: Vec<StreamOp>, state: StreamState) {
        self.complete_recv(call, ops, state, true);
    }

    /// Complete the armed receive with a failure; no ops are delivered.
    pub fn fail_recv(&self, call: &Call) {
        self.complete_recv(call, Vec::new(), StreamState::Open, false);
    }

    fn complete_recv(&self, call: &Call, ops: Vec<StreamOp>, state: StreamState, success: bool) {
        let recv = self
            .state
            .lock()
            .streams
            .remove(&call.stream_id())
            .expect("receive op armed for stream");
        recv.ops.lock().extend(ops);
        recv.state.set(state);
        let mut tasks = ClosureList::new();
        (recv.on_done)(success, &mut tasks);
        tasks.run();
    }

    /// Report a connectivity change through the server's wired watcher.
    pub fn set_connectivity(&self, state: ConnectivityState) {
        let watcher = self.state.lock().connectivity.clone();
        if let Some(watcher) = watcher {
            let mut tasks = ClosureList::new();
            watcher(state, &mut tasks);
            tasks.run();
        }
    }

    pub fn goaway_count(&self) -> usize {
        self.state.lock().goaway_messages.len()
    }

    pub fn goaway_messages(&self) -> Vec<Bytes> {
        self.state.lock().goaway_messages.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn bound_pollset_count(&self) -> usize {
        self.state.lock().bound_pollsets.len()
    }

    /// True when a receive op is currently armed for `call`.
    pub fn recv_armed(&self, call: &Call) -> bool {
        self.state.lock().streams.contains_key(&call.stream_id())
    }
}

impl Transport for MockTransport {
    fn perform_op(&self, op: TransportOp, tasks: &mut ClosureList) {
        {
            let mut state = self.state.lock();
            if let Some(pollset) = op.bind_pollset {
                state.bound_pollsets.push(pollset);
            }
            if let Some(accept) = op.set_accept_stream {
                state.accept = Some(accept);
            }
            if let Some(watcher) = op.on_connectivity_state_change {
                state.connectivity = Some(watcher);
            }
            if op.send_goaway {
                let message = op.goaway_message.clone().unwrap_or_default();
                state.goaway_messages.push(message);
            }
            if op.disconnect {
                state.disconnects += 1;
            }
        }
        if let Some(consumed) = op.on_consumed {
            tasks.add(consumed, true);
        }
    }

    fn start_stream_op(&self, stream_id: u64, op: TransportStreamOp, _tasks: &mut ClosureList) {
        if let Some(recv) = op.recv {
            self.state.lock().streams.insert(stream_id, recv);
        }
    }
}

/// A listener double recording its lifecycle.
#[derive(Default)]
pub struct MockListener {
    started: AtomicBool,
    destroyed: AtomicBool,
    pollsets_seen: AtomicUsize,
}

impl MockListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn pollsets_seen(&self) -> usize {
        self.pollsets_seen.load(Ordering::Acquire)
    }
}

impl Listener for MockListener {
    fn start(&self, _server: &Arc<Server>, pollsets: &[Pollset], _tasks: &mut ClosureList) {
        self.pollsets_seen.store(pollsets.len(), Ordering::Release);
        self.started.store(true, Ordering::Release);
    }

    fn destroy(&self, _server: &Arc<Server>, done: Closure, tasks: &mut ClosureList) {
        let was_destroyed = self.destroyed.swap(true, Ordering::AcqRel);
        assert!(!was_destroyed, "listener destroyed twice");
        tasks.add(done, true);
    }
}

/// Build an initial-metadata stream op with `:path` and `:authority` interned
/// in `ctx` (the connection's context, so key identity holds).
pub fn initial_metadata(ctx: &MetadataContext, path: &str, authority: &str) -> StreamOp {
    initial_metadata_with(ctx, path, authority, &[])
}

/// Like [`initial_metadata`], with extra headers the server should keep.
pub fn initial_metadata_with(
    ctx: &MetadataContext,
    path: &str,
    authority: &str,
    extra: &[(&str, &str)],
) -> StreamOp {
    let mut batch = MetadataBatch::new();
    batch.push(ctx.intern(":path"), ctx.intern(path));
    batch.push(ctx.intern(":authority"), ctx.intern(authority));
    for (key, value) in extra {
        batch.push(ctx.intern(key), ctx.intern(value));
    }
    StreamOp::Metadata(batch)
}

/// A message stream op.
pub fn message(payload: &[u8]) -> StreamOp {
    StreamOp::Message(Bytes::copy_from_slice(payload))
}

/// Install a tracing subscriber honoring `RUST_LOG` for test runs. Safe to
/// call from every test; only the first installation wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
