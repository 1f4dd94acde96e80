//! Connection fan-out for shutdown operations.
//!
//! The broadcaster snapshots the live connection list under `mu_global`, then
//! issues one transport op per connection without any lock held, so a slow
//! transport cannot stall server state. Each op owns its goaway message; the
//! transport's consumed-callback frees it.

use std::sync::Arc;

use bytes::Bytes;

use crate::channel::Connection;
use crate::closure::{closure, ClosureList};
use crate::transport::{GoawayStatus, TransportOp};

const GOAWAY_MESSAGE: &[u8] = b"Server shutdown";

pub(crate) struct ChannelBroadcaster {
    channels: Vec<Arc<Connection>>,
}

impl ChannelBroadcaster {
    /// Snapshot the current connections; the caller holds `mu_global`. Each
    /// clone is the broadcast reference keeping its connection alive through
    /// the fan-out.
    pub(crate) fn snapshot(connections: &[Arc<Connection>]) -> Self {
        Self {
            channels: connections.to_vec(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    /// Issue one goaway/disconnect op per snapshotted connection, releasing
    /// each broadcast reference after its op is emitted.
    pub(crate) fn shutdown(
        self,
        send_goaway: bool,
        force_disconnect: bool,
        tasks: &mut ClosureList,
    ) {
        for conn in self.channels {
            let message = Bytes::from_static(GOAWAY_MESSAGE);
            let owned = message.clone();
            conn.perform_op(
                TransportOp {
                    send_goaway,
                    goaway_message: Some(message),
                    goaway_status: GoawayStatus::Ok,
                    disconnect: force_disconnect,
                    on_consumed: Some(closure(move |_, _| drop(owned))),
                    ..TransportOp::default()
                },
                tasks,
            );
        }
    }
}
