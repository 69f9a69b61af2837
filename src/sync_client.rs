//! Sequential reference path: one connection, one blocking query at a time.
//!
//! Used to compare against concurrent dispatch, never by the dispatcher itself.

use std::io;

use tracing::debug;

use crate::config::ConnectParams;
use crate::driver::{ConnId, Connection};
use crate::error::{ConnectError, DispatchError, ReapError};
use crate::tcp::{ResultSet, TcpConnection};

pub struct SyncClient {
    conn: TcpConnection,
}

impl SyncClient {
    pub fn connect(params: &ConnectParams) -> Result<Self, ConnectError> {
        Ok(Self {
            conn: TcpConnection::open(params)?,
        })
    }

    pub fn id(&self) -> ConnId {
        self.conn.id()
    }

    pub fn query(&mut self, payload: &str) -> Result<ResultSet, DispatchError> {
        if payload.is_empty() {
            return Err(DispatchError::EmptyPayload);
        }
        let conn = self.conn.id();
        self.conn.query_blocking(payload).map_err(|e| match e {
            ReapError::Malformed => DispatchError::Result { conn },
            ReapError::Failed(detail) => DispatchError::Request { conn, detail },
        })
    }

    pub fn close(self) -> io::Result<()> {
        self.conn.close()
    }
}

/// Run `payloads` one after another on a single connection.
///
/// Stops at the first failure. Returns how many queries completed.
pub fn run_sequential<S, F>(
    params: &ConnectParams,
    payloads: &[S],
    mut on_result: F,
) -> Result<usize, DispatchError>
where
    S: AsRef<str>,
    F: FnMut(&str, &ResultSet),
{
    let mut client = SyncClient::connect(params)?;
    for payload in payloads {
        let payload = payload.as_ref();
        let result = client.query(payload)?;
        on_result(payload, &result);
    }
    if let Err(e) = client.close() {
        debug!(error = %e, "close failed");
    }
    Ok(payloads.len())
}
