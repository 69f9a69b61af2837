//! The seam between the dispatcher and whatever actually talks to the backend.
//!
//! A [`Driver`] opens connections and answers readiness polls over a set of
//! them. A [`Connection`] carries exactly one request: submit, wait for the
//! poll to call it readable, reap, close. The dispatcher never touches sockets
//! itself, so tests can drive it with a scripted driver.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::error::{ConnectError, ReapError};

/// Identifies one open connection among all currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one readiness poll, partitioned by connection.
///
/// All three lists empty means nothing became ready within the wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A response is ready to reap, or the peer closed the connection.
    pub readable: Vec<ConnId>,
    /// The connection hit a socket-level error.
    pub errored: Vec<ConnId>,
    /// The connection has no outstanding async request.
    pub rejected: Vec<ConnId>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.errored.is_empty() && self.rejected.is_empty()
    }
}

/// One open connection carrying a single request.
pub trait Connection {
    /// Decoded response handed to callbacks.
    type Output;

    fn id(&self) -> ConnId;

    /// Send `payload` without waiting for the response.
    fn submit(&mut self, payload: &str) -> io::Result<()>;

    /// Take the response of a connection the last poll reported readable.
    fn reap(&mut self) -> Result<Self::Output, ReapError>;

    /// Most recent error text seen on this connection, if any.
    fn last_error(&self) -> Option<String>;

    fn close(self) -> io::Result<()>;
}

/// Connection factory plus readiness primitive.
pub trait Driver {
    type Conn: Connection;

    /// Whether this driver can issue non-blocking requests and poll their readiness.
    fn supports_async(&self) -> bool;

    /// Open a fresh connection to the backend.
    fn connect(&mut self) -> Result<Self::Conn, ConnectError>;

    /// Wait at most `wait` for any of `conns` to become readable, errored or rejected.
    ///
    /// `Err` means the poll primitive itself failed, not a single connection.
    fn poll<'c, I>(&mut self, conns: I, wait: Duration) -> io::Result<Readiness>
    where
        I: Iterator<Item = &'c mut Self::Conn>,
        Self::Conn: 'c;
}

/// Result type produced by a driver's connections.
pub type Output<D> = <<D as Driver>::Conn as Connection>::Output;
