//! Error types for dispatch and for the driver seam.

use std::io;

use thiserror::Error;

use crate::driver::ConnId;

/// Failure of a [`Dispatcher`](crate::dispatcher::Dispatcher) operation.
///
/// Enqueue-time variants leave the queue untouched. Every variant returned
/// from `run` means the whole batch was aborted and torn down.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unable to run async queries: driver cannot multiplex non-blocking requests")]
    CapabilityUnavailable,

    #[error("over {limit} queued requests")]
    QueueFull { limit: usize },

    #[error("empty request payload")]
    EmptyPayload,

    #[error("no queued requests")]
    EmptyQueue,

    #[error("cannot connect to backend: {0}")]
    Connection(#[from] ConnectError),

    #[error("batch timed out after {elapsed_ms} ms (limit {timeout_ms} ms)")]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("malformed result on connection {conn}")]
    Result { conn: ConnId },

    #[error("request failed on connection {conn}: {detail}")]
    Request { conn: ConnId, detail: String },

    #[error("connection {conn} is not an async request")]
    ProtocolViolation { conn: ConnId },
}

/// Failure to open a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot resolve '{0}'")]
    Resolve(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("backend refused connection: {0}")]
    Rejected(String),

    #[error("unexpected handshake reply: {0}")]
    Handshake(&'static str),

    #[error("connection id {0} is already in flight")]
    DuplicateId(ConnId),
}

/// Failure to reap a result from a connection reported readable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReapError {
    /// Bytes arrived but do not form a result.
    #[error("malformed result")]
    Malformed,

    /// The request itself failed. Carries the backend or socket error text.
    #[error("{0}")]
    Failed(String),
}
