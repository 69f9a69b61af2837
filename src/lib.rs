//! Library crate for pollq: concurrent batch dispatch of queries over one control thread.
//!
//! [`Dispatcher`] queues requests, opens one connection per request, submits them all
//! without blocking and multiplexes their readiness until every callback has fired or
//! the batch deadline passes. Transport is pluggable through [`driver::Driver`];
//! [`tcp::TcpDriver`] is the real one. `backend` is a small server speaking the same
//! line protocol, used by the binaries, the integration tests and the bench.

pub mod backend;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod sync_client;
pub mod tcp;

pub use config::{Config, ConnectParams, DispatchConfig};
pub use dispatcher::{BatchStats, Dispatcher};
pub use error::{ConnectError, DispatchError};
pub use tcp::{ResultSet, TcpDriver};
