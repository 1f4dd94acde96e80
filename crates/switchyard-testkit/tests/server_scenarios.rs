//! End-to-end scenarios: a server, one mock transport, and an application
//! consumer on a completion queue.

mod common;

use std::time::{Duration, SystemTime};

use switchyard_core::{
    BatchCallOutputs, CallState, ChannelArgs, CompletionEvent, ConnectivityState, MetadataBatch,
    RegisteredCallOutputs, StreamOp, StreamState, MAX_REQUESTED_CALLS_ARG,
};
use switchyard_testkit::{initial_metadata, initial_metadata_with};

use common::{harness, harness_with, NO_WAIT, WAIT};

#[test]
fn happy_path_unregistered() {
    let h = harness(ChannelArgs::new());

    let out = BatchCallOutputs::new();
    h.server
        .request_call(out.clone(), h.cq.clone(), h.cq.clone(), 1)
        .unwrap();

    let call = h.transport.accept_stream();
    h.transport.deliver(
        &call,
        vec![initial_metadata_with(&h.ctx, "/x", "h", &[("x-extra", "1")])],
        StreamState::Open,
    );

    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 1, success: true });

    let details = out.details.lock();
    assert_eq!(details.method, "/x");
    assert_eq!(details.host, "h");
    let published = out.call.lock().clone().expect("call published");
    assert!(std::sync::Arc::ptr_eq(
        &published.completion_queue().expect("bound"),
        &h.cq
    ));

    // :path and :authority were consumed; the extra header was kept
    let metadata = out.initial_metadata.lock();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata.entries[0].key.as_str(), "x-extra");
    assert_eq!(metadata.entries[0].value.as_str(), "1");

    assert_eq!(call.state(), CallState::Activated);
}

#[test]
fn call_pends_until_request_arrives() {
    let h = harness(ChannelArgs::new());

    let call = h.transport.accept_stream();
    h.transport
        .deliver(&call, vec![initial_metadata(&h.ctx, "/y", "h")], StreamState::Open);
    assert_eq!(call.state(), CallState::Pending);
    assert!(h.cq.next(NO_WAIT).is_none());

    let out = BatchCallOutputs::new();
    h.server
        .request_call(out.clone(), h.cq.clone(), h.cq.clone(), 2)
        .unwrap();

    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 2, success: true });
    assert_eq!(call.state(), CallState::Activated);
    assert_eq!(out.details.lock().method, "/y");
}

#[test]
fn request_pool_exhaustion_fails_the_overflow() {
    let h = harness(ChannelArgs::new().set_integer(MAX_REQUESTED_CALLS_ARG, 1));
    assert_eq!(h.server.max_requested_calls(), 1);

    let queued = BatchCallOutputs::new();
    h.server
        .request_call(queued, h.cq.clone(), h.cq.clone(), 3)
        .unwrap();

    let overflow = BatchCallOutputs::new();
    h.server
        .request_call(overflow.clone(), h.cq.clone(), h.cq.clone(), 4)
        .unwrap();

    // the overflow fails; the first stays outstanding
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 4, success: false });
    assert!(overflow.call.lock().is_none());
    assert!(h.cq.next(NO_WAIT).is_none());

    // the queued request still matches a stream
    let call = h.transport.accept_stream();
    h.transport
        .deliver(&call, vec![initial_metadata(&h.ctx, "/x", "h")], StreamState::Open);
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 3, success: true });
}

#[test]
fn registered_method_with_wildcard_host() {
    let registered = std::sync::Mutex::new(None);
    let h = harness_with(ChannelArgs::new(), |server| {
        *registered.lock().unwrap() = server.register_method("/z", None);
    });
    let method = registered.into_inner().unwrap().expect("registration succeeds");

    // a batch request on the unregistered bucket must not steal the call
    let batch_out = BatchCallOutputs::new();
    h.server
        .request_call(batch_out, h.cq.clone(), h.cq.clone(), 10)
        .unwrap();

    let out = RegisteredCallOutputs::new();
    h.server
        .request_registered_call(&method, out.clone(), h.cq.clone(), h.cq.clone(), 11)
        .unwrap();

    let call = h.transport.accept_stream();
    h.transport
        .deliver(&call, vec![initial_metadata(&h.ctx, "/z", "h")], StreamState::Open);

    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 11, success: true });
    assert!(out.call.lock().is_some());
    assert!(h.cq.next(NO_WAIT).is_none(), "batch request must stay parked");
}

#[test]
fn deadline_propagates_from_metadata() {
    let h = harness(ChannelArgs::new());

    let out = BatchCallOutputs::new();
    h.server
        .request_call(out.clone(), h.cq.clone(), h.cq.clone(), 20)
        .unwrap();

    let deadline = SystemTime::now() + Duration::from_secs(30);
    let mut batch = MetadataBatch::new();
    batch.push(h.ctx.intern(":path"), h.ctx.intern("/d"));
    batch.push(h.ctx.intern(":authority"), h.ctx.intern("h"));
    batch.deadline = Some(deadline);

    let call = h.transport.accept_stream();
    h.transport
        .deliver(&call, vec![StreamOp::Metadata(batch)], StreamState::Open);

    assert!(h.cq.next(WAIT).unwrap().success);
    assert_eq!(out.details.lock().deadline, Some(deadline));
    assert_eq!(call.deadline(), Some(deadline));
}

#[test]
fn shutdown_with_pending_call() {
    let h = harness(ChannelArgs::new());

    let call = h.transport.accept_stream();
    h.transport
        .deliver(&call, vec![initial_metadata(&h.ctx, "/p", "h")], StreamState::Open);
    assert_eq!(call.state(), CallState::Pending);

    h.server.shutdown_and_notify(&h.cq, 30);

    // the pending call was zombified and its kill task ran
    assert!(call.is_destroyed());
    // goaway issued across the (one) connection
    assert_eq!(h.transport.goaway_count(), 1);
    assert_eq!(h.transport.goaway_messages()[0].as_ref(), b"Server shutdown");
    // the connection is still alive, so the shutdown tag is not yet published
    assert!(h.cq.next(NO_WAIT).is_none());

    // requests submitted after the flag fail back to the application
    let late = BatchCallOutputs::new();
    h.server
        .request_call(late, h.cq.clone(), h.cq.clone(), 31)
        .unwrap();
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 31, success: false });

    // connection death completes the shutdown
    h.transport.set_connectivity(ConnectivityState::FatalFailure);
    assert!(!h.server.has_open_connections());
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 30, success: true });

    h.server.destroy();
}

#[test]
fn shutdown_after_published_completes_immediately() {
    let h = harness(ChannelArgs::new());

    h.server.shutdown_and_notify(&h.cq, 40);
    h.transport.set_connectivity(ConnectivityState::FatalFailure);
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 40, success: true });

    let goaways = h.transport.goaway_count();
    h.server.shutdown_and_notify(&h.cq, 41);
    let ev = h.cq.next(WAIT).unwrap();
    assert_eq!(ev, CompletionEvent { tag: 41, success: true });
    // no re-broadcast on the fast path
    assert_eq!(h.transport.goaway_count(), goaways);
}

#[test]
fn every_shutdown_tag_is_published_once() {
    let h = harness(ChannelArgs::new());

    h.server.shutdown_and_notify(&h.cq, 50);
    h.server.shutdown_and_notify(&h.cq, 51);
    h.transport.set_connectivity(ConnectivityState::FatalFailure);

    let mut tags = vec![
        h.cq.next(WAIT).unwrap(),
        h.cq.next(WAIT).unwrap(),
    ];
    tags.sort_by_key(|ev| ev.tag);
    assert_eq!(
        tags,
        vec![
            CompletionEvent { tag: 50, success: true },
            CompletionEvent { tag: 51, success: true },
        ]
    );
    assert!(h.cq.next(NO_WAIT).is_none());
}

#[test]
fn cancel_all_calls_force_disconnects() {
    let h = harness(ChannelArgs::new());
    assert_eq!(h.transport.disconnect_count(), 0);
    h.server.cancel_all_calls();
    assert_eq!(h.transport.disconnect_count(), 1);
    assert_eq!(h.transport.goaway_count(), 0);
}
