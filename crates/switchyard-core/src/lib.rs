//! switchyard-core: the core of an RPC server.
//!
//! This crate accepts incoming streams arriving over already-established
//! multiplexed transport connections, matches each stream's (host, method)
//! coordinates against waiting application requests, and coordinates
//! lifecycle across concurrent connections, calls, and consumers. It defines:
//!
//! - The call–request matching engine ([`Server::request_call`],
//!   [`Server::request_registered_call`], one matcher bucket per method)
//! - Registered-method dispatch with wildcard-host fallback
//!   ([`Server::register_method`])
//! - The per-call state machine ([`CallState`]) and the server-side receive
//!   interception that feeds it
//! - Two-phase shutdown ([`Server::shutdown_and_notify`],
//!   [`Server::cancel_all_calls`])
//! - The collaborator contracts: [`Transport`], [`Listener`],
//!   [`ChannelFilter`], [`CompletionQueue`], [`MetadataContext`]
//!
//! The core owns no executor: it runs on whichever thread delivers a
//! transport callback, an application entry point, or a completion-queue
//! consumer. Work produced under locks is batched on a [`ClosureList`] and
//! drained by the outer entry point after all locks are released.

#![forbid(unsafe_op_in_unsafe_fn)]

mod broadcast;
mod call;
mod channel;
mod closure;
mod completion;
mod error;
mod filter;
mod matcher;
mod metadata;
mod request;
mod server;
mod shutdown;
mod stack;
mod transport;

pub use call::{Call, CallState};
pub use closure::{closure, Closure, ClosureList};
pub use completion::{CompletionEvent, CompletionQueue, Pollset, Tag};
pub use error::RequestError;
pub use filter::{ArgValue, ChannelArgs, ChannelElem, ChannelFilter, FilterArgs};
pub use metadata::{MdStr, MetadataArray, MetadataBatch, MetadataContext, Metadatum};
pub use request::{BatchCallOutputs, CallDetails, OutCell, RegisteredCallOutputs};
pub use server::{Listener, RegisteredMethod, Server, MAX_REQUESTED_CALLS_ARG};
pub use stack::LockfreeStack;
pub use transport::{
    AcceptStreamFn, ConnectivityFn, ConnectivityState, GoawayStatus, RecvOp, StreamOp,
    StreamState, StreamStateCell, Transport, TransportOp, TransportStreamOp,
};
