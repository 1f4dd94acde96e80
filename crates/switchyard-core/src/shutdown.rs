//! Two-phase shutdown coordination.
//!
//! Phase one (`shutdown_and_notify`): record the caller's tag, drain every
//! matcher (fail waiting requests, zombify pending calls), raise the shutdown
//! flag, destroy listeners, and broadcast goaway across the connections.
//! Phase two (`maybe_finish_shutdown`): every time a connection dies or a
//! listener reports destruction, re-drain and check for quiescence; once the
//! connection list is empty and every listener is done, publish one
//! completion per recorded tag, exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcast::ChannelBroadcaster;
use crate::closure::{closure, ClosureList};
use crate::completion::{CompletionQueue, Tag};
use crate::server::{CallQueues, GlobalState, RegisteredMethod, Server};

/// One caller of `shutdown_and_notify`, to be published at completion.
pub(crate) struct ShutdownTag {
    pub(crate) tag: Tag,
    pub(crate) cq: Arc<CompletionQueue>,
}

const SHUTDOWN_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

impl Server {
    /// Begin shutdown. Returns immediately; a completion with `tag` is
    /// published on `cq` once every connection and listener has died. Safe to
    /// call repeatedly: each tag gets exactly one completion, and only the
    /// first call runs the drain and broadcast.
    pub fn shutdown_and_notify(self: &Arc<Self>, cq: &Arc<CompletionQueue>, tag: Tag) {
        let mut tasks = ClosureList::new();
        let mut global = self.lock_global();
        cq.begin_op();

        if global.shutdown_published {
            cq.end_op(tag, true, closure(|_, _| {}));
            drop(global);
            tasks.run();
            return;
        }
        global.shutdown_tags.push(ShutdownTag {
            tag,
            cq: Arc::clone(cq),
        });
        if self.is_shutdown() {
            // an earlier shutdown will publish this tag too
            drop(global);
            tasks.run();
            return;
        }

        global.last_shutdown_message = Some(Instant::now());
        let broadcaster = ChannelBroadcaster::snapshot(&global.connections);
        tracing::debug!(connections = broadcaster.len(), "server shutdown requested");

        {
            let mut queues = self.lock_call_queues();
            self.kill_pending_work(&global.registered_methods, &mut queues, &mut tasks);
        }

        self.set_shutdown_flag();
        self.maybe_finish_shutdown(&mut global, &mut tasks);
        let listeners = global.listeners.clone();
        drop(global);

        for listener in listeners {
            let server = Arc::clone(self);
            let done = closure(move |_, tasks: &mut ClosureList| {
                let mut global = server.lock_global();
                global.listeners_destroyed += 1;
                server.maybe_finish_shutdown(&mut global, tasks);
            });
            listener.destroy(self, done, &mut tasks);
        }

        broadcaster.shutdown(true, false, &mut tasks);
        tasks.run();
    }

    /// Force-disconnect every current connection. Calls attached to them are
    /// aborted by the transport layer.
    pub fn cancel_all_calls(self: &Arc<Self>) {
        let mut tasks = ClosureList::new();
        let broadcaster = {
            let global = self.lock_global();
            ChannelBroadcaster::snapshot(&global.connections)
        };
        broadcaster.shutdown(false, true, &mut tasks);
        tasks.run();
    }

    /// Re-drain pending work and publish the shutdown tags if the server is
    /// quiescent. Caller holds `mu_global` (and not `mu_call`).
    pub(crate) fn maybe_finish_shutdown(
        self: &Arc<Self>,
        global: &mut GlobalState,
        tasks: &mut ClosureList,
    ) {
        if !self.is_shutdown() || global.shutdown_published {
            return;
        }

        {
            let mut queues = self.lock_call_queues();
            self.kill_pending_work(&global.registered_methods, &mut queues, tasks);
        }

        if !global.connections.is_empty()
            || global.listeners_destroyed < global.listeners.len()
        {
            let due = global
                .last_shutdown_message
                .map_or(true, |at| at.elapsed() >= SHUTDOWN_PROGRESS_INTERVAL);
            if due {
                global.last_shutdown_message = Some(Instant::now());
                tracing::debug!(
                    connections = global.connections.len(),
                    listeners_pending = global.listeners.len() - global.listeners_destroyed,
                    listeners = global.listeners.len(),
                    "waiting for connections and listeners before finishing shutdown"
                );
            }
            return;
        }

        global.shutdown_published = true;
        for sdt in global.shutdown_tags.drain(..) {
            // one server reference per post, released when the application
            // consumes the completion
            let server = Arc::clone(self);
            sdt.cq.end_op(sdt.tag, true, closure(move |_, _| drop(server)));
        }
    }

    /// Fail every waiting request and zombify every pending call, across the
    /// unregistered matcher and all registered ones. Caller holds `mu_call`.
    pub(crate) fn kill_pending_work(
        self: &Arc<Self>,
        methods: &[Arc<RegisteredMethod>],
        queues: &mut CallQueues,
        tasks: &mut ClosureList,
    ) {
        self.unregistered_matcher().kill_requests(self);
        self.unregistered_matcher().zombify_all_pending(queues, tasks);
        for rm in methods {
            rm.matcher().kill_requests(self);
            rm.matcher().zombify_all_pending(queues, tasks);
        }
    }
}
