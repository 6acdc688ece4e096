//! # Error Taxonomy
//!
//! Purpose: Give every layer of the client one error type with enough
//! structure for the retry executor to classify failures.
//!
//! ## Design Principles
//! 1. **Typed Failures**: Each failure class is a variant, not a string probe.
//! 2. **Transparent Propagation**: Underlying I/O errors surface unwrapped so
//!    callers see the same root cause they would without pooling.
//! 3. **Classification at the Edge**: `is_transient` and `poisons_connection`
//!    are the only predicates the retry/pool layers consult.

use thiserror::Error;

/// Errors surfaced by the meshkv client.
#[derive(Error, Debug)]
pub enum Error {
    /// Network or IO failure while connecting, reading, or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or payload violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Node returned an application-level error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The client was configured without any cluster nodes.
    #[error("no cluster nodes configured")]
    NoNodes,

    /// A batch operation was submitted after the worker pool stopped.
    #[error("worker pool is stopped")]
    WorkerPoolStopped,

    /// Node address could not be parsed into a socket address.
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    /// An operation was issued on a closed client.
    #[error("client is closed")]
    ClientClosed,
}

impl Error {
    /// Whether this failure is a transient network-class error worth a
    /// failover retry. Protocol and server errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Whether the connection this error was observed on must be destroyed
    /// rather than returned to the pool. A framing violation leaves the
    /// stream desynced, so it poisons the connection even though it is fatal.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }
}

/// Result type for the meshkv client.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_is_transient_and_poisons() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_transient());
        assert!(err.poisons_connection());
    }

    #[test]
    fn test_protocol_is_fatal_but_poisons() {
        let err = Error::Protocol("bad tag".to_string());
        assert!(!err.is_transient());
        assert!(err.poisons_connection());
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let err = Error::Server("quorum not reached".to_string());
        assert!(!err.is_transient());
        assert!(!err.poisons_connection());
    }

    #[test]
    fn test_misuse_errors_are_fatal() {
        assert!(!Error::WorkerPoolStopped.is_transient());
        assert!(!Error::NoNodes.is_transient());
        assert!(!Error::ClientClosed.is_transient());
        assert!(!Error::WorkerPoolStopped.poisons_connection());
        assert!(!Error::ClientClosed.poisons_connection());
    }
}
