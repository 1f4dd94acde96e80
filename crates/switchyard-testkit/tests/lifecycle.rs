//! Server lifecycle: queue registration, method registration, listeners,
//! filters, connectivity teardown, and destruction contracts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use switchyard_core::{
    BatchCallOutputs, ChannelArgs, ChannelElem, ChannelFilter, CompletionQueue, ConnectivityState,
    FilterArgs, MetadataContext, RequestError, Server, StreamState, TransportStreamOp,
};
use switchyard_testkit::{initial_metadata, MockListener, MockTransport};

use common::{attach, harness, NO_WAIT, WAIT};

#[test]
fn completion_queue_registration_is_idempotent() {
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    server.register_completion_queue(&cq);
    server.start();
    let (transport, _ctx) = attach(&server);
    // one registered queue, one pollset bound at transport setup
    assert_eq!(transport.bound_pollset_count(), 1);
    assert!(cq.is_server_cq());
}

#[test]
fn unregistered_notify_queue_is_rejected() {
    let h = harness(ChannelArgs::new());
    let foreign = CompletionQueue::new();
    let result = h
        .server
        .request_call(BatchCallOutputs::new(), h.cq.clone(), foreign, 1);
    assert_eq!(result.unwrap_err(), RequestError::NotServerCompletionQueue);
}

#[test]
fn duplicate_method_registration_is_rejected() {
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    assert!(server.register_method("/m", Some("h")).is_some());
    assert!(server.register_method("/m", Some("h")).is_none());
    // same method under a different host is a distinct registration
    assert!(server.register_method("/m", None).is_some());
    assert!(server.register_method("", None).is_none());
}

#[test]
fn method_registration_after_start_is_rejected() {
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    server.start();
    assert!(server.register_method("/late", None).is_none());
}

#[test]
fn listener_lifecycle_and_shutdown_publication() {
    let listener = MockListener::new();
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    server.add_listener(listener.clone());
    server.start();
    assert!(listener.started());
    assert_eq!(listener.pollsets_seen(), 1);

    // no connections: shutdown completes once the listener reports destroyed
    server.shutdown_and_notify(&cq, 5);
    assert!(listener.destroyed());
    let ev = cq.next(WAIT).unwrap();
    assert_eq!(ev.tag, 5);
    assert!(ev.success);

    server.destroy();
}

#[test]
fn destroy_without_listeners_needs_no_shutdown() {
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    server.destroy();
}

#[test]
fn connection_teardown_updates_open_connections() {
    let h = harness(ChannelArgs::new());
    assert!(h.server.has_open_connections());
    h.transport.set_connectivity(ConnectivityState::FatalFailure);
    assert!(!h.server.has_open_connections());
}

#[test]
fn nonfatal_connectivity_changes_keep_the_connection() {
    let h = harness(ChannelArgs::new());
    h.transport.set_connectivity(ConnectivityState::Connecting);
    h.transport.set_connectivity(ConnectivityState::Ready);
    h.transport.set_connectivity(ConnectivityState::TransientFailure);
    assert!(h.server.has_open_connections());
    // the watcher re-armed each time and still sees the fatal transition
    h.transport.set_connectivity(ConnectivityState::FatalFailure);
    assert!(!h.server.has_open_connections());
}

#[test]
fn second_transport_serves_calls_independently() {
    let h = harness(ChannelArgs::new());
    let (transport2, ctx2) = attach(&h.server);

    let out = BatchCallOutputs::new();
    h.server
        .request_call(out.clone(), h.cq.clone(), h.cq.clone(), 9)
        .unwrap();

    let call = transport2.accept_stream();
    transport2.deliver(&call, vec![initial_metadata(&ctx2, "/t2", "h2")], StreamState::Open);
    assert!(h.cq.next(WAIT).unwrap().success);
    assert_eq!(out.details.lock().method, "/t2");
    assert_eq!(out.details.lock().host, "h2");
}

#[derive(Default)]
struct Counters {
    channels: AtomicUsize,
    calls: AtomicUsize,
    stream_ops: AtomicUsize,
    channel_teardowns: AtomicUsize,
}

struct CountingFilter {
    counters: Arc<Counters>,
}

struct CountingElem {
    counters: Arc<Counters>,
}

impl ChannelFilter for CountingFilter {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn init_channel_elem(&self, args: FilterArgs<'_>) -> Box<dyn ChannelElem> {
        assert!(!args.is_first && !args.is_last);
        self.counters.channels.fetch_add(1, Ordering::Relaxed);
        Box::new(CountingElem {
            counters: Arc::clone(&self.counters),
        })
    }
}

impl ChannelElem for CountingElem {
    fn init_call_elem(&self) {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn start_transport_stream_op(&self, _op: &mut TransportStreamOp) {
        self.counters.stream_ops.fetch_add(1, Ordering::Relaxed);
    }

    fn destroy_channel_elem(&self) {
        self.counters.channel_teardowns.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn configured_filters_see_the_call_stack() {
    let counters = Arc::new(Counters::default());
    let filter: Arc<dyn ChannelFilter> = Arc::new(CountingFilter {
        counters: Arc::clone(&counters),
    });
    let server = Server::create_from_filters(vec![filter], ChannelArgs::new());
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    server.start();

    let transport = MockTransport::new();
    let ctx = MetadataContext::new();
    server.setup_transport(transport.clone(), &[], Arc::clone(&ctx), &ChannelArgs::new());
    assert_eq!(counters.channels.load(Ordering::Relaxed), 1);

    let call = transport.accept_stream();
    assert_eq!(counters.calls.load(Ordering::Relaxed), 1);
    // the initial receive already flowed through the stack
    assert!(counters.stream_ops.load(Ordering::Relaxed) >= 1);

    transport.deliver(&call, vec![initial_metadata(&ctx, "/f", "h")], StreamState::Open);

    transport.set_connectivity(ConnectivityState::FatalFailure);
    assert_eq!(counters.channel_teardowns.load(Ordering::Relaxed), 1);
}

#[test]
fn late_request_after_shutdown_fails_cleanly() {
    let h = harness(ChannelArgs::new());
    h.server.shutdown_and_notify(&h.cq, 70);
    let out = BatchCallOutputs::new();
    h.server
        .request_call(out.clone(), h.cq.clone(), h.cq.clone(), 71)
        .unwrap();
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev.tag, 71);
    assert!(!ev.success);
    assert!(out.call.lock().is_none());
    assert!(h.cq.next(NO_WAIT).is_none(), "shutdown tag waits for the connection");
}

#[test]
fn channel_args_are_preserved() {
    let args = ChannelArgs::new()
        .set_str("switchyard.test", "value")
        .set_integer("switchyard.window", 64);
    let server = Server::create_from_filters(Vec::new(), args);
    assert_eq!(server.channel_args().str("switchyard.test"), Some("value"));
    assert_eq!(server.channel_args().integer("switchyard.window"), Some(64));
}

#[test]
fn shutdown_tag_waits_for_every_listener() {
    let first = MockListener::new();
    let second = MockListener::new();
    let server = Server::create_from_filters(Vec::new(), ChannelArgs::new());
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    server.add_listener(first.clone());
    server.add_listener(second.clone());
    server.start();

    server.shutdown_and_notify(&cq, 80);
    assert!(first.destroyed());
    assert!(second.destroyed());
    let ev = cq.next(WAIT).unwrap();
    assert_eq!(ev.tag, 80);
    server.destroy();
}
