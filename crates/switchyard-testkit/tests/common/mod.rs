//! Shared harness for server tests.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{ChannelArgs, CompletionQueue, MetadataContext, Server};
use switchyard_testkit::MockTransport;

/// Generous wait for completions that must arrive.
pub const WAIT: Duration = Duration::from_millis(500);
/// Short wait for completions that must not arrive.
pub const NO_WAIT: Duration = Duration::from_millis(25);

pub struct Harness {
    pub server: Arc<Server>,
    pub cq: Arc<CompletionQueue>,
    pub transport: Arc<MockTransport>,
    pub ctx: Arc<MetadataContext>,
}

/// Server with one registered queue, started, with one mock transport bound.
pub fn harness(args: ChannelArgs) -> Harness {
    harness_with(args, |_| {})
}

/// Like [`harness`], running `configure` (method registration, listeners)
/// before the server starts.
pub fn harness_with(args: ChannelArgs, configure: impl FnOnce(&Arc<Server>)) -> Harness {
    switchyard_testkit::init_tracing();
    let server = Server::create_from_filters(Vec::new(), args);
    let cq = CompletionQueue::new();
    server.register_completion_queue(&cq);
    configure(&server);
    server.start();
    let (transport, ctx) = attach(&server);
    Harness {
        server,
        cq,
        transport,
        ctx,
    }
}

/// Bind one more mock transport to the server.
pub fn attach(server: &Arc<Server>) -> (Arc<MockTransport>, Arc<MetadataContext>) {
    let transport = MockTransport::new();
    let ctx = MetadataContext::new();
    server.setup_transport(
        transport.clone(),
        &[],
        Arc::clone(&ctx),
        &ChannelArgs::new(),
    );
    (transport, ctx)
}
