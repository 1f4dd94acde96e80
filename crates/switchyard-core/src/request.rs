//! Requested-call slots and their lifecycle.
//!
//! An application request is heap-allocated at the entry point, copied into a
//! pool slot when queued, and published back to the application through its
//! notification queue once matched (or failed). The done callback of the
//! posted completion returns the slot to the free-list when the application
//! consumes the event, so a slot is always in exactly one of: free-list,
//! a matcher's request stack, or in-flight.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::call::{Call, CallInner, MessageOutcome};
use crate::closure::closure;
use crate::completion::{CompletionQueue, Tag};
use crate::metadata::MetadataArray;
use crate::server::{RegisteredMethod, Server};

/// A shared out-parameter cell. The server fills it before publishing the
/// matching completion; the application reads it after consuming the event.
pub type OutCell<T> = Arc<Mutex<T>>;

fn out_cell<T: Default>() -> OutCell<T> {
    Arc::new(Mutex::new(T::default()))
}

/// Batch-call details published to the application.
#[derive(Debug, Clone, Default)]
pub struct CallDetails {
    pub method: String,
    pub host: String,
    pub deadline: Option<SystemTime>,
}

/// Output cells for [`Server::request_call`].
#[derive(Clone)]
pub struct BatchCallOutputs {
    pub call: OutCell<Option<Call>>,
    pub details: OutCell<CallDetails>,
    pub initial_metadata: OutCell<MetadataArray>,
}

impl BatchCallOutputs {
    pub fn new() -> Self {
        Self {
            call: out_cell(),
            details: out_cell(),
            initial_metadata: out_cell(),
        }
    }
}

impl Default for BatchCallOutputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Output cells for [`Server::request_registered_call`]. The payload cell is
/// present only when the application asked for the first message.
#[derive(Clone)]
pub struct RegisteredCallOutputs {
    pub call: OutCell<Option<Call>>,
    pub deadline: OutCell<Option<SystemTime>>,
    pub initial_metadata: OutCell<MetadataArray>,
    pub payload: Option<OutCell<Option<Bytes>>>,
}

impl RegisteredCallOutputs {
    pub fn new() -> Self {
        Self {
            call: out_cell(),
            deadline: out_cell(),
            initial_metadata: out_cell(),
            payload: None,
        }
    }

    pub fn with_payload() -> Self {
        Self {
            payload: Some(out_cell()),
            ..Self::new()
        }
    }
}

impl Default for RegisteredCallOutputs {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum RequestKind {
    Batch(BatchCallOutputs),
    Registered {
        method: Arc<RegisteredMethod>,
        outputs: RegisteredCallOutputs,
    },
}

/// One application request, either still heap-owned or copied into a slot.
pub(crate) struct RequestedCall {
    pub(crate) tag: Tag,
    pub(crate) cq_bound: Arc<CompletionQueue>,
    pub(crate) cq_notify: Arc<CompletionQueue>,
    pub(crate) kind: RequestKind,
}

impl RequestedCall {
    /// Null the outputs before a failure is published.
    fn clear_outputs(&self) {
        match &self.kind {
            RequestKind::Batch(outputs) => {
                *outputs.call.lock() = None;
                outputs.initial_metadata.lock().clear();
            }
            RequestKind::Registered { outputs, .. } => {
                *outputs.call.lock() = None;
                outputs.initial_metadata.lock().clear();
            }
        }
    }
}

/// A requested call by location: already in a pool slot, or still on the heap
/// (queueing failed before a slot was assigned).
pub(crate) enum RcRef {
    Slot(u32),
    Heap(Box<RequestedCall>),
}

impl Server {
    /// Bind a matched call to its request and publish the completion. Called
    /// with the call already ACTIVATED.
    pub(crate) fn begin_call(self: &Arc<Self>, calld: &Arc<CallInner>, slot: u32) {
        let (cq_bound, kind) = {
            let guard = self.slot(slot).lock();
            let rc = guard.as_ref().expect("request slot populated");
            let kind = match &rc.kind {
                RequestKind::Batch(outputs) => RequestKind::Batch(outputs.clone()),
                RequestKind::Registered { method, outputs } => RequestKind::Registered {
                    method: Arc::clone(method),
                    outputs: outputs.clone(),
                },
            };
            (Arc::clone(&rc.cq_bound), kind)
        };

        calld.bind_completion_queue(cq_bound);

        match kind {
            RequestKind::Batch(outputs) => {
                *outputs.call.lock() = Some(Call::from_inner(Arc::clone(calld)));
                let (method, host, deadline, metadata) = calld.take_batch_details();
                {
                    let mut details = outputs.details.lock();
                    details.method = method;
                    details.host = host;
                    details.deadline = deadline;
                }
                *outputs.initial_metadata.lock() = metadata;
                self.publish_request(slot, true);
            }
            RequestKind::Registered { outputs, .. } => {
                *outputs.call.lock() = Some(Call::from_inner(Arc::clone(calld)));
                let (deadline, metadata) = calld.take_registered_details();
                *outputs.deadline.lock() = deadline;
                *outputs.initial_metadata.lock() = metadata;
                if let Some(payload_cell) = &outputs.payload {
                    match calld.take_message_or_park(slot) {
                        MessageOutcome::Ready(payload) => {
                            *payload_cell.lock() = payload;
                            self.publish_request(slot, true);
                        }
                        // published later, when the first message (or the
                        // stream's half-close) arrives
                        MessageOutcome::Parked => {}
                    }
                } else {
                    self.publish_request(slot, true);
                }
            }
        }
    }

    /// Complete a registered request that parked waiting for its first
    /// message payload.
    pub(crate) fn complete_parked(self: &Arc<Self>, slot: u32, payload: Option<Bytes>) {
        let payload_cell = {
            let guard = self.slot(slot).lock();
            match &guard.as_ref().expect("request slot populated").kind {
                RequestKind::Registered { outputs, .. } => outputs.payload.clone(),
                RequestKind::Batch(_) => unreachable!("parked slot holds a registered request"),
            }
        };
        if let Some(cell) = payload_cell {
            *cell.lock() = payload;
        }
        self.publish_request(slot, true);
    }

    /// Fail a request: null the outputs and publish `success = false`. The
    /// done callback returns the slot (if any) and releases the server
    /// reference when the application consumes the event.
    pub(crate) fn fail_call(self: &Arc<Self>, rc: RcRef) {
        match rc {
            RcRef::Slot(slot) => {
                {
                    let guard = self.slot(slot).lock();
                    guard
                        .as_ref()
                        .expect("request slot populated")
                        .clear_outputs();
                }
                self.publish_request(slot, false);
            }
            RcRef::Heap(rc) => {
                rc.clear_outputs();
                let server = Arc::clone(self);
                let cq = Arc::clone(&rc.cq_notify);
                cq.end_op(
                    rc.tag,
                    false,
                    closure(move |_, _| {
                        drop(rc);
                        drop(server);
                    }),
                );
            }
        }
    }

    /// Post the completion for a slot-resident request.
    pub(crate) fn publish_request(self: &Arc<Self>, slot: u32, success: bool) {
        let (tag, cq) = {
            let guard = self.slot(slot).lock();
            let rc = guard.as_ref().expect("request slot populated");
            (rc.tag, Arc::clone(&rc.cq_notify))
        };
        let server = Arc::clone(self);
        cq.end_op(
            tag,
            success,
            closure(move |_, _| server.free_slot(slot)),
        );
    }

    pub(crate) fn free_slot(&self, slot: u32) {
        *self.slot(slot).lock() = None;
        self.freelist().push(slot);
    }
}
