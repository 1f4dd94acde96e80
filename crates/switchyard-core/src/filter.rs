//! Channel filter contract and channel arguments.
//!
//! The per-connection call stack is ordered: the server surface sits first,
//! then the filters configured at server creation, then any extras passed to
//! `setup_transport`, then the connected-channel position (the transport
//! itself). The surface and the transport are built in; everything between is
//! a [`ChannelFilter`] that builds one [`ChannelElem`] per connection.

use std::sync::Arc;

use crate::metadata::MetadataContext;
use crate::transport::TransportStreamOp;

/// A channel argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Integer(i64),
    Str(String),
}

/// Ordered key/value configuration copied by the server at construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelArgs {
    args: Vec<(String, ArgValue)>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_integer(mut self, key: &str, value: i64) -> Self {
        self.args.push((key.to_owned(), ArgValue::Integer(value)));
        self
    }

    pub fn set_str(mut self, key: &str, value: &str) -> Self {
        self.args.push((key.to_owned(), ArgValue::Str(value.to_owned())));
        self
    }

    /// Last-set integer value for `key`, if any.
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.args.iter().rev().find_map(|(k, v)| match v {
            ArgValue::Integer(i) if k == key => Some(*i),
            _ => None,
        })
    }

    /// Last-set string value for `key`, if any.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.args.iter().rev().find_map(|(k, v)| match v {
            ArgValue::Str(s) if k == key => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ArgValue)> {
        self.args.iter()
    }
}

/// Everything a filter sees when its per-connection element is built.
pub struct FilterArgs<'a> {
    pub channel_args: &'a ChannelArgs,
    pub mdctx: &'a Arc<MetadataContext>,
    /// Position flags within the stack. The server surface claims the first
    /// position and the transport the last, so configured filters always see
    /// `false` for both.
    pub is_first: bool,
    pub is_last: bool,
}

/// A filter participating in the per-connection call stack.
pub trait ChannelFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the per-connection element.
    fn init_channel_elem(&self, args: FilterArgs<'_>) -> Box<dyn ChannelElem>;
}

/// The per-connection element of a [`ChannelFilter`]. Hooks default to no-ops.
pub trait ChannelElem: Send + Sync {
    /// A stream was accepted on this connection.
    fn init_call_elem(&self) {}

    /// A call on this connection is being destroyed.
    fn destroy_call_elem(&self) {}

    /// A per-stream op is flowing down the stack; the element may inspect or
    /// rewrite it before the transport sees it.
    fn start_transport_stream_op(&self, _op: &mut TransportStreamOp) {}

    /// The connection is being torn down.
    fn destroy_channel_elem(&self) {}
}
