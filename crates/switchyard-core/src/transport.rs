//! The transport collaborator contract.
//!
//! A transport owns framing, flow control, and the wire format; the core only
//! emits [`TransportOp`]s at it (pollset binding, accept-stream wiring,
//! connectivity subscription, goaway/disconnect) and intercepts the receive
//! side of per-stream ops. Submission is non-blocking: the transport queues
//! the op on its own runloop and fires the attached callbacks later.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::call::Call;
use crate::closure::{Closure, ClosureList};
use crate::completion::Pollset;
use crate::metadata::MetadataBatch;

/// Receive-side stream state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    SendClosed,
    RecvClosed,
    Closed,
}

/// Connection-level state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    FatalFailure,
}

/// Status attached to a goaway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoawayStatus {
    Ok,
}

/// One element of a receive operation buffer.
#[derive(Debug, Clone)]
pub enum StreamOp {
    Metadata(MetadataBatch),
    Message(Bytes),
}

/// The cell through which the transport publishes a stream's current state.
#[derive(Default)]
pub struct StreamStateCell {
    state: Mutex<Option<StreamState>>,
}

impl StreamStateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, state: StreamState) {
        *self.state.lock() = Some(state);
    }

    pub fn get(&self) -> StreamState {
        self.state.lock().unwrap_or(StreamState::Open)
    }
}

/// The receive half of a per-stream operation: the buffer the transport fills,
/// the state cell it updates, and the callback it fires on completion.
pub struct RecvOp {
    pub ops: Arc<Mutex<Vec<StreamOp>>>,
    pub state: Arc<StreamStateCell>,
    pub on_done: Closure,
}

/// A per-stream operation flowing down the call stack to the transport.
/// The server core only touches the receive half; send ops belong to layers
/// out of scope here.
#[derive(Default)]
pub struct TransportStreamOp {
    pub recv: Option<RecvOp>,
}

impl Default for RecvOp {
    fn default() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            state: StreamStateCell::new(),
            on_done: crate::closure::closure(|_, _| {}),
        }
    }
}

/// Callback wired by the server: invoked by the transport for each accepted
/// stream, returns the call the transport will drive.
pub type AcceptStreamFn = Arc<dyn Fn(u64) -> Call + Send + Sync>;

/// Callback wired by the server: invoked by the transport on each
/// connectivity state change.
pub type ConnectivityFn = Arc<dyn Fn(ConnectivityState, &mut ClosureList) + Send + Sync>;

/// A connection-level operation emitted at the transport.
pub struct TransportOp {
    pub bind_pollset: Option<Pollset>,
    pub set_accept_stream: Option<AcceptStreamFn>,
    pub on_connectivity_state_change: Option<ConnectivityFn>,
    pub send_goaway: bool,
    pub goaway_message: Option<Bytes>,
    pub goaway_status: GoawayStatus,
    pub disconnect: bool,
    /// Runs once the transport has taken ownership of the op; frees the
    /// goaway message buffer on broadcast ops.
    pub on_consumed: Option<Closure>,
}

impl Default for TransportOp {
    fn default() -> Self {
        Self {
            bind_pollset: None,
            set_accept_stream: None,
            on_connectivity_state_change: None,
            send_goaway: false,
            goaway_message: None,
            goaway_status: GoawayStatus::Ok,
            disconnect: false,
            on_consumed: None,
        }
    }
}

/// A bound transport. All entry points are non-blocking.
pub trait Transport: Send + Sync {
    /// Apply a connection-level op.
    fn perform_op(&self, op: TransportOp, tasks: &mut ClosureList);

    /// Apply a per-stream op for the stream identified at accept time.
    fn start_stream_op(&self, stream_id: u64, op: TransportStreamOp, tasks: &mut ClosureList);
}
