// src/error.rs

//! Error taxonomy for the driver core.
//!
//! Every fallible operation in the crate returns [`Error`]. The variants map
//! one-to-one onto the failure kinds of the wire protocol: transport faults,
//! malformed bytes, codec registration problems, version negotiation
//! failures, closed resources, deadlines, misuse, and remote failures.
//!
//! `Error` is `Clone` so a single failure can be fanned out to every waiter
//! parked on a request status; transport errors hold their `io::Error`
//! behind an `Arc` for that reason.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure kinds surfaced by the driver core.
#[derive(Debug, Clone)]
pub enum Error {
    /// Read/write/connect failure on the underlying transport.
    Transport(Arc<io::Error>),
    /// Malformed bytes encountered while decoding.
    InvalidEncoding(String),
    /// A type id with no registered constructor or deserializer.
    TypeUnknown(i32),
    /// Two message types registered under the same type id.
    DuplicateType(i32),
    /// A negative version id in a user-type frame.
    VersionNegative(i32),
    /// A user-type frame ended before its terminator.
    TruncatedFrame,
    /// Version negotiation failed: the peers' ranges are disjoint.
    ProtocolVersionMismatch {
        /// Protocol whose negotiation failed.
        protocol: String,
        /// Local supported range, inclusive.
        local: (i32, i32),
        /// Remote supported range, inclusive.
        remote: (i32, i32),
    },
    /// Operation on a closed channel.
    ChannelClosed,
    /// Operation on a closed connection.
    ConnectionClosed(String),
    /// A request deadline elapsed before the response arrived.
    Timeout,
    /// API misuse: close of channel 0, `request` on the service thread,
    /// a response posted outside a receive dispatch, and similar.
    IllegalState(&'static str),
    /// The remote peer answered with a failure response; the payload is the
    /// remote-supplied reason.
    Remote(String),
    /// The operation was cancelled because a parent resource closed.
    Cancelled(String),
    /// The per-channel request-id counter is exhausted.
    IdSpaceExhausted,
}

impl Error {
    /// Shorthand for an [`Error::InvalidEncoding`] with a formatted reason.
    pub(crate) fn encoding(reason: impl Into<String>) -> Self {
        Error::InvalidEncoding(reason.into())
    }

    /// True if this error means the resource (channel or connection) is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::ConnectionClosed(_) | Error::Cancelled(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::InvalidEncoding(reason) => write!(f, "invalid encoding: {}", reason),
            Error::TypeUnknown(id) => write!(f, "unknown type id: {}", id),
            Error::DuplicateType(id) => write!(f, "type id {} is already registered", id),
            Error::VersionNegative(v) => write!(f, "negative version id: {}", v),
            Error::TruncatedFrame => write!(f, "user-type frame truncated before terminator"),
            Error::ProtocolVersionMismatch {
                protocol,
                local,
                remote,
            } => write!(
                f,
                "protocol {:?} version mismatch: local supports {}..={}, remote supports {}..={}",
                protocol, local.0, local.1, remote.0, remote.1
            ),
            Error::ChannelClosed => write!(f, "channel is closed"),
            Error::ConnectionClosed(reason) if reason.is_empty() => {
                write!(f, "connection is closed")
            }
            Error::ConnectionClosed(reason) => write!(f, "connection is closed: {}", reason),
            Error::Timeout => write!(f, "request timed out"),
            Error::IllegalState(what) => write!(f, "illegal state: {}", what),
            Error::Remote(reason) => write!(f, "remote failure: {}", reason),
            Error::Cancelled(reason) if reason.is_empty() => write!(f, "request cancelled"),
            Error::Cancelled(reason) => write!(f, "request cancelled: {}", reason),
            Error::IdSpaceExhausted => write!(f, "request id space exhausted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_detail() {
        let err = Error::TypeUnknown(17);
        assert!(format!("{}", err).contains("17"));

        let err = Error::ProtocolVersionMismatch {
            protocol: "cache".to_string(),
            local: (2, 5),
            remote: (6, 7),
        };
        let s = format!("{}", err);
        assert!(s.contains("cache"));
        assert!(s.contains("2..=5"));
        assert!(s.contains("6..=7"));
    }

    #[test]
    fn transport_error_preserves_source() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(std::error::Error::source(&err).is_some());
        // Clone shares the same underlying io::Error.
        let clone = err.clone();
        assert!(format!("{}", clone).contains("pipe"));
    }

    #[test]
    fn is_closed_classification() {
        assert!(Error::ChannelClosed.is_closed());
        assert!(Error::ConnectionClosed(String::new()).is_closed());
        assert!(Error::Cancelled("shutdown".to_string()).is_closed());
        assert!(!Error::Timeout.is_closed());
        assert!(!Error::TruncatedFrame.is_closed());
    }
}
