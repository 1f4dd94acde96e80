//! Error types for the server surface.
//!
//! Only input-validation failures surface synchronously; everything else
//! (resource exhaustion, shutdown races, connection failure) is reported
//! asynchronously as a completion with `success = false`.

use std::fmt;

/// Synchronous errors from the request entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// The notification completion queue was never registered with the server.
    NotServerCompletionQueue,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotServerCompletionQueue => {
                write!(f, "notification queue is not a server completion queue")
            }
        }
    }
}

impl std::error::Error for RequestError {}
