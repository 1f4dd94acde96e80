//! The server object and its application entry points.
//!
//! Two mutexes split the state: `mu_global` covers connections, listeners,
//! the registered-method registry, and shutdown bookkeeping; `mu_call` covers
//! every matcher's pending-call queue. When both are needed the order is
//! `mu_global` then `mu_call`. Request slots move between the free-list, a
//! matcher's request stack, and in-flight publication purely through atomic
//! stack operations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::call::{Call, CallInner};
use crate::channel::{Connection, RegisteredMethodTable};
use crate::closure::{closure, Closure, ClosureList};
use crate::completion::{CompletionQueue, Pollset, Tag};
use crate::error::RequestError;
use crate::filter::{ChannelArgs, ChannelFilter, FilterArgs};
use crate::matcher::{MatcherId, RequestMatcher};
use crate::metadata::MetadataContext;
use crate::request::{
    BatchCallOutputs, RcRef, RegisteredCallOutputs, RequestKind, RequestedCall,
};
use crate::shutdown::ShutdownTag;
use crate::stack::LockfreeStack;
use crate::transport::{Transport, TransportOp};

/// Channel arg naming the request-slot pool size.
pub const MAX_REQUESTED_CALLS_ARG: &str = "switchyard.max_requested_calls";

const MAX_REQUESTED_CALLS_ENV: &str = "SWITCHYARD_MAX_REQUESTED_CALLS";
const DEFAULT_MAX_REQUESTED_CALLS: usize = 32768;

fn resolve_max_requested_calls(args: &ChannelArgs) -> usize {
    if let Some(n) = args.integer(MAX_REQUESTED_CALLS_ARG) {
        if n > 0 {
            return n as usize;
        }
    }
    std::env::var(MAX_REQUESTED_CALLS_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MAX_REQUESTED_CALLS)
}

/// A listener bound to the server. `start` is called once at server start;
/// `destroy` must invoke `done` exactly once when teardown finishes.
pub trait Listener: Send + Sync {
    fn start(&self, server: &Arc<Server>, pollsets: &[Pollset], tasks: &mut ClosureList);
    fn destroy(&self, server: &Arc<Server>, done: Closure, tasks: &mut ClosureList);
}

/// A (method, host) pair pre-declared by the application. Owns its own
/// matcher bucket. A `None` host is the wildcard.
pub struct RegisteredMethod {
    method: String,
    host: Option<String>,
    matcher: RequestMatcher,
}

impl RegisteredMethod {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub(crate) fn matcher(&self) -> &RequestMatcher {
        &self.matcher
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        method: &str,
        host: Option<&str>,
        id: MatcherId,
        entries: usize,
    ) -> Self {
        Self {
            method: method.to_owned(),
            host: host.map(str::to_owned),
            matcher: RequestMatcher::new(id, entries),
        }
    }
}

/// Call-side state guarded by `mu_call`: one pending-call queue per matcher,
/// indexed by [`MatcherId`].
pub(crate) struct CallQueues {
    pending: Vec<VecDeque<Arc<CallInner>>>,
}

impl CallQueues {
    pub(crate) fn queue_mut(&mut self, id: MatcherId) -> &mut VecDeque<Arc<CallInner>> {
        &mut self.pending[id.0]
    }
}

/// State guarded by `mu_global`.
pub(crate) struct GlobalState {
    pub(crate) cqs: Vec<Arc<CompletionQueue>>,
    pub(crate) pollsets: Vec<Pollset>,
    pub(crate) registered_methods: Vec<Arc<RegisteredMethod>>,
    pub(crate) connections: Vec<Arc<Connection>>,
    pub(crate) listeners: Vec<Arc<dyn Listener>>,
    pub(crate) listeners_destroyed: usize,
    pub(crate) shutdown_published: bool,
    pub(crate) shutdown_tags: Vec<ShutdownTag>,
    pub(crate) last_shutdown_message: Option<Instant>,
}

pub struct Server {
    channel_args: ChannelArgs,
    filters: Vec<Arc<dyn ChannelFilter>>,
    max_requested_calls: usize,
    /// Backing storage for requested calls, indexed by slot id.
    slots: Box<[Mutex<Option<RequestedCall>>]>,
    /// Free slot ids.
    freelist: LockfreeStack,
    unregistered_matcher: RequestMatcher,
    mu_global: Mutex<GlobalState>,
    mu_call: Mutex<CallQueues>,
    shutdown_flag: AtomicBool,
    started: AtomicBool,
}

impl Server {
    /// Build a server with the given configured filter stack and a copy of
    /// the channel args.
    pub fn create_from_filters(
        filters: Vec<Arc<dyn ChannelFilter>>,
        args: ChannelArgs,
    ) -> Arc<Server> {
        let max_requested_calls = resolve_max_requested_calls(&args);
        let freelist = LockfreeStack::new(max_requested_calls);
        for id in 0..max_requested_calls as u32 {
            freelist.push(id);
        }
        Arc::new(Server {
            channel_args: args,
            filters,
            max_requested_calls,
            slots: (0..max_requested_calls).map(|_| Mutex::new(None)).collect(),
            freelist,
            unregistered_matcher: RequestMatcher::new(MatcherId(0), max_requested_calls),
            mu_global: Mutex::new(GlobalState {
                cqs: Vec::new(),
                pollsets: Vec::new(),
                registered_methods: Vec::new(),
                connections: Vec::new(),
                listeners: Vec::new(),
                listeners_destroyed: 0,
                shutdown_published: false,
                shutdown_tags: Vec::new(),
                last_shutdown_message: None,
            }),
            mu_call: Mutex::new(CallQueues {
                pending: vec![VecDeque::new()],
            }),
            shutdown_flag: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Register `cq` as a server completion queue. Idempotent.
    pub fn register_completion_queue(&self, cq: &Arc<CompletionQueue>) {
        let mut global = self.mu_global.lock();
        if global.cqs.iter().any(|existing| Arc::ptr_eq(existing, cq)) {
            return;
        }
        cq.mark_server_cq();
        global.cqs.push(Arc::clone(cq));
    }

    /// Pre-declare a (method, host) pair, giving it a dedicated matcher.
    /// Returns `None` (with a logged error) on an empty method name, a
    /// duplicate registration, or registration after start.
    pub fn register_method(
        &self,
        method: &str,
        host: Option<&str>,
    ) -> Option<Arc<RegisteredMethod>> {
        if method.is_empty() {
            tracing::error!("method registration requires a method name");
            return None;
        }
        if self.started.load(Ordering::Acquire) {
            tracing::error!(method, "method registration after server start");
            return None;
        }
        let mut global = self.mu_global.lock();
        if global
            .registered_methods
            .iter()
            .any(|rm| rm.method() == method && rm.host() == host)
        {
            tracing::error!(
                method,
                host = host.unwrap_or("*"),
                "duplicate method registration"
            );
            return None;
        }
        let id = MatcherId(global.registered_methods.len() + 1);
        let rm = Arc::new(RegisteredMethod {
            method: method.to_owned(),
            host: host.map(str::to_owned),
            matcher: RequestMatcher::new(id, self.max_requested_calls),
        });
        global.registered_methods.push(Arc::clone(&rm));
        // mu_global → mu_call, growing the pending-queue vector in step
        self.mu_call.lock().pending.push(VecDeque::new());
        Some(rm)
    }

    /// Materialize the per-queue pollsets and start every listener.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = ClosureList::new();
        let (listeners, pollsets) = {
            let mut global = self.mu_global.lock();
            global.pollsets = global.cqs.iter().map(|cq| cq.pollset()).collect();
            (global.listeners.clone(), global.pollsets.clone())
        };
        self.started.store(true, Ordering::Release);
        for listener in &listeners {
            listener.start(self, &pollsets, &mut tasks);
        }
        tasks.run();
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.mu_global.lock().listeners.push(listener);
    }

    /// Bind a transport: build the per-connection call stack and method
    /// table, link the connection, and wire stream accept plus connectivity
    /// watching.
    pub fn setup_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        extra_filters: &[Arc<dyn ChannelFilter>],
        mdctx: Arc<MetadataContext>,
        args: &ChannelArgs,
    ) {
        let mut tasks = ClosureList::new();

        let (pollsets, methods) = {
            let global = self.mu_global.lock();
            (
                global.cqs.iter().map(|cq| cq.pollset()).collect::<Vec<_>>(),
                global.registered_methods.clone(),
            )
        };
        for pollset in pollsets {
            transport.perform_op(
                TransportOp {
                    bind_pollset: Some(pollset),
                    ..TransportOp::default()
                },
                &mut tasks,
            );
        }

        // Stack order: server surface, configured filters, extras, transport.
        // The surface and the transport are built in; everything else builds
        // one element per connection here.
        let elems = self
            .filters
            .iter()
            .chain(extra_filters)
            .map(|filter| {
                filter.init_channel_elem(FilterArgs {
                    channel_args: args,
                    mdctx: &mdctx,
                    is_first: false,
                    is_last: false,
                })
            })
            .collect();

        let table = RegisteredMethodTable::build(&methods, &mdctx);
        let conn = Connection::new(
            Arc::clone(self),
            Arc::clone(&transport),
            &mdctx,
            table,
            elems,
        );

        self.mu_global.lock().connections.push(Arc::clone(&conn));

        let accept_conn = Arc::clone(&conn);
        let watch_conn = Arc::downgrade(&conn);
        transport.perform_op(
            TransportOp {
                set_accept_stream: Some(Arc::new(move |stream_id| {
                    Call::create(&accept_conn, stream_id)
                })),
                on_connectivity_state_change: Some(Arc::new(move |state, tasks| {
                    if let Some(conn) = watch_conn.upgrade() {
                        conn.connectivity_changed(state, tasks);
                    }
                })),
                disconnect: self.shutdown_flag.load(Ordering::Acquire),
                ..TransportOp::default()
            },
            &mut tasks,
        );
        tasks.run();
    }

    /// Request the next incoming call on any method. The completion carries
    /// `tag` on `cq_notify`; the outputs are filled before it is published.
    pub fn request_call(
        self: &Arc<Self>,
        outputs: BatchCallOutputs,
        cq_bound: Arc<CompletionQueue>,
        cq_notify: Arc<CompletionQueue>,
        tag: Tag,
    ) -> Result<(), RequestError> {
        if !cq_notify.is_server_cq() {
            return Err(RequestError::NotServerCompletionQueue);
        }
        cq_notify.begin_op();
        let rc = Box::new(RequestedCall {
            tag,
            cq_bound,
            cq_notify,
            kind: RequestKind::Batch(outputs),
        });
        let mut tasks = ClosureList::new();
        self.queue_call_request(rc, &mut tasks);
        tasks.run();
        Ok(())
    }

    /// Request the next incoming call on a registered method.
    pub fn request_registered_call(
        self: &Arc<Self>,
        method: &Arc<RegisteredMethod>,
        outputs: RegisteredCallOutputs,
        cq_bound: Arc<CompletionQueue>,
        cq_notify: Arc<CompletionQueue>,
        tag: Tag,
    ) -> Result<(), RequestError> {
        if !cq_notify.is_server_cq() {
            return Err(RequestError::NotServerCompletionQueue);
        }
        cq_notify.begin_op();
        let rc = Box::new(RequestedCall {
            tag,
            cq_bound,
            cq_notify,
            kind: RequestKind::Registered {
                method: Arc::clone(method),
                outputs,
            },
        });
        let mut tasks = ClosureList::new();
        self.queue_call_request(rc, &mut tasks);
        tasks.run();
        Ok(())
    }

    /// Move a request into a pool slot and offer it to its matcher. After
    /// shutdown, or with the free-list empty, the request fails back to the
    /// application instead.
    fn queue_call_request(self: &Arc<Self>, rc: Box<RequestedCall>, tasks: &mut ClosureList) {
        if self.shutdown_flag.load(Ordering::Acquire) {
            self.fail_call(RcRef::Heap(rc));
            return;
        }
        let Some(slot) = self.freelist.pop() else {
            tracing::warn!("request slot pool exhausted; failing request");
            self.fail_call(RcRef::Heap(rc));
            return;
        };
        let method = match &rc.kind {
            RequestKind::Registered { method, .. } => Some(Arc::clone(method)),
            RequestKind::Batch(_) => None,
        };
        *self.slots[slot as usize].lock() = Some(*rc);
        match method {
            Some(method) => method.matcher().enqueue_request(self, slot, tasks),
            None => self.unregistered_matcher.enqueue_request(self, slot, tasks),
        }
    }

    /// Tear the server down. Requires prior shutdown (or that no listener was
    /// ever added) and that every listener has reported destruction.
    pub fn destroy(self: &Arc<Self>) {
        let mut global = self.mu_global.lock();
        assert!(
            self.shutdown_flag.load(Ordering::Acquire) || global.listeners.is_empty(),
            "server destroyed without shutdown while listeners are installed"
        );
        assert_eq!(
            global.listeners_destroyed,
            global.listeners.len(),
            "server destroyed before all listeners reported destruction"
        );
        global.listeners.clear();
    }

    pub fn has_open_connections(&self) -> bool {
        !self.mu_global.lock().connections.is_empty()
    }

    pub fn channel_args(&self) -> &ChannelArgs {
        &self.channel_args
    }

    pub fn max_requested_calls(&self) -> usize {
        self.max_requested_calls
    }

    // ------------------------------------------------------------------
    // crate-internal plumbing
    // ------------------------------------------------------------------

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown_flag(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
    }

    pub(crate) fn unregistered_matcher(&self) -> &RequestMatcher {
        &self.unregistered_matcher
    }

    pub(crate) fn lock_call_queues(&self) -> MutexGuard<'_, CallQueues> {
        self.mu_call.lock()
    }

    pub(crate) fn lock_global(&self) -> MutexGuard<'_, GlobalState> {
        self.mu_global.lock()
    }

    pub(crate) fn slot(&self, slot: u32) -> &Mutex<Option<RequestedCall>> {
        &self.slots[slot as usize]
    }

    pub(crate) fn freelist(&self) -> &LockfreeStack {
        &self.freelist
    }

    /// Unlink a connection and reevaluate shutdown; the transport reference
    /// is released by a deferred finalizer. Caller holds `mu_global`.
    pub(crate) fn destroy_connection(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        global: &mut GlobalState,
        tasks: &mut ClosureList,
    ) {
        if conn.mark_orphaned() {
            return;
        }
        global.connections.retain(|existing| !Arc::ptr_eq(existing, conn));
        self.maybe_finish_shutdown(global, tasks);
        let conn = Arc::clone(conn);
        tasks.add(
            closure(move |_, _| {
                tracing::debug!("finishing connection teardown");
                conn.release();
            }),
            true,
        );
    }
}
