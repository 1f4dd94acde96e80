//! Per-transport connection state and the registered-method lookup table.
//!
//! A connection is created when a transport is bound to the server. At setup
//! it re-interns every registered (host, method) pair into its own metadata
//! context and builds an open-addressed table over them, so dispatch is a
//! couple of identity comparisons per probe. The table is immutable for the
//! connection's lifetime; the worst probe distance is recorded at build and
//! bounds every lookup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::closure::ClosureList;
use crate::filter::ChannelElem;
use crate::metadata::{kv_hash, MdStr, MetadataContext};
use crate::server::{RegisteredMethod, Server};
use crate::transport::{
    ConnectivityState, Transport, TransportOp, TransportStreamOp,
};

struct TableSlot {
    method: MdStr,
    host: Option<MdStr>,
    registered: Arc<RegisteredMethod>,
}

/// Open-addressed (host, method) → registered-method table, `2N` slots,
/// linear probing, probe count bounded by the build-time maximum.
pub(crate) struct RegisteredMethodTable {
    slots: Box<[Option<TableSlot>]>,
    max_probes: u32,
}

impl RegisteredMethodTable {
    /// Build the per-connection table, re-interning every method/host string
    /// into `ctx` so lookups can compare handle identity.
    pub(crate) fn build(
        methods: &[Arc<RegisteredMethod>],
        ctx: &MetadataContext,
    ) -> Option<Self> {
        if methods.is_empty() {
            return None;
        }
        let slots_len = methods.len() * 2;
        let mut slots: Vec<Option<TableSlot>> = (0..slots_len).map(|_| None).collect();
        let mut max_probes = 0u32;
        for rm in methods {
            let host = rm.host().map(|h| ctx.intern(h));
            let method = ctx.intern(rm.method());
            let hash = kv_hash(host.as_ref().map_or(0, MdStr::hash), method.hash());
            let mut probes = 0u32;
            while slots[(hash as usize + probes as usize) % slots_len].is_some() {
                probes += 1;
            }
            max_probes = max_probes.max(probes);
            slots[(hash as usize + probes as usize) % slots_len] = Some(TableSlot {
                method,
                host,
                registered: Arc::clone(rm),
            });
        }
        Some(Self {
            slots: slots.into_boxed_slice(),
            max_probes,
        })
    }

    /// Two passes, each bounded by `max_probes + 1` probes: exact host match,
    /// then wildcard (no host). Comparison is handle identity throughout.
    pub(crate) fn lookup(&self, host: &MdStr, path: &MdStr) -> Option<&Arc<RegisteredMethod>> {
        let slots_len = self.slots.len();
        let hash = kv_hash(host.hash(), path.hash()) as usize;
        for i in 0..=self.max_probes as usize {
            if let Some(slot) = &self.slots[(hash + i) % slots_len] {
                if slot.host.as_ref().is_some_and(|h| h.same(host)) && slot.method.same(path) {
                    return Some(&slot.registered);
                }
            }
        }
        let hash = kv_hash(0, path.hash()) as usize;
        for i in 0..=self.max_probes as usize {
            if let Some(slot) = &self.slots[(hash + i) % slots_len] {
                if slot.host.is_none() && slot.method.same(path) {
                    return Some(&slot.registered);
                }
            }
        }
        None
    }

    #[cfg(test)]
    fn max_probes(&self) -> u32 {
        self.max_probes
    }
}

/// Per-transport channel data.
pub struct Connection {
    server: Arc<Server>,
    path_key: MdStr,
    authority_key: MdStr,
    registered: Option<RegisteredMethodTable>,
    connectivity: Mutex<ConnectivityState>,
    orphaned: AtomicBool,
    /// Released by the deferred finalizer when the connection dies.
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Per-connection elements of the configured/extra filters, in stack
    /// order between the server surface and the transport.
    elems: Vec<Box<dyn ChannelElem>>,
}

impl Connection {
    pub(crate) fn new(
        server: Arc<Server>,
        transport: Arc<dyn Transport>,
        mdctx: &Arc<MetadataContext>,
        registered: Option<RegisteredMethodTable>,
        elems: Vec<Box<dyn ChannelElem>>,
    ) -> Arc<Self> {
        let path_key = mdctx.intern(":path");
        let authority_key = mdctx.intern(":authority");
        Arc::new(Self {
            server,
            path_key,
            authority_key,
            registered,
            connectivity: Mutex::new(ConnectivityState::Idle),
            orphaned: AtomicBool::new(false),
            transport: Mutex::new(Some(transport)),
            elems,
        })
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// The interned `:path` and `:authority` keys for this connection.
    pub(crate) fn keys(&self) -> (MdStr, MdStr) {
        (self.path_key.clone(), self.authority_key.clone())
    }

    pub(crate) fn lookup_registered(
        &self,
        host: &MdStr,
        path: &MdStr,
    ) -> Option<&Arc<RegisteredMethod>> {
        self.registered.as_ref()?.lookup(host, path)
    }

    pub(crate) fn for_each_elem(&self, mut f: impl FnMut(&dyn ChannelElem)) {
        for elem in &self.elems {
            f(elem.as_ref());
        }
    }

    /// Emit a connection-level op, unless the transport was already released.
    pub(crate) fn perform_op(&self, op: TransportOp, tasks: &mut ClosureList) {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) => transport.perform_op(op, tasks),
            None => tracing::debug!("transport op dropped after connection teardown"),
        }
    }

    pub(crate) fn start_stream_op(
        &self,
        stream_id: u64,
        op: TransportStreamOp,
        tasks: &mut ClosureList,
    ) {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) => transport.start_stream_op(stream_id, op, tasks),
            None => tracing::debug!(stream_id, "stream op dropped after connection teardown"),
        }
    }

    /// Connectivity watcher: re-arm on every non-fatal change; tear the
    /// connection down on FATAL_FAILURE.
    pub(crate) fn connectivity_changed(
        self: &Arc<Self>,
        state: ConnectivityState,
        tasks: &mut ClosureList,
    ) {
        *self.connectivity.lock() = state;
        if state != ConnectivityState::FatalFailure {
            let weak = Arc::downgrade(self);
            self.perform_op(
                TransportOp {
                    on_connectivity_state_change: Some(Arc::new(move |state, tasks| {
                        if let Some(conn) = weak.upgrade() {
                            conn.connectivity_changed(state, tasks);
                        }
                    })),
                    ..TransportOp::default()
                },
                tasks,
            );
        } else {
            let server = Arc::clone(&self.server);
            let mut global = server.lock_global();
            server.destroy_connection(self, &mut global, tasks);
        }
    }

    /// Mark orphaned; returns the previous value so unlink is idempotent.
    pub(crate) fn mark_orphaned(&self) -> bool {
        self.orphaned.swap(true, Ordering::AcqRel)
    }

    /// The deferred finalizer: release the transport reference and tear down
    /// the filter elements.
    pub(crate) fn release(&self) {
        *self.transport.lock() = None;
        for elem in &self.elems {
            elem.destroy_channel_elem();
        }
    }
}
