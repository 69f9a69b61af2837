//! Defaults and wire limits shared by the dispatcher, the TCP driver and the backend.

use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_DBNAME: &str = "test";
pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Max queued requests per batch.
pub const DEFAULT_LIMIT: usize = 20;
/// Global batch deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Max block time of a single readiness poll.
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_secs(2);

/// Largest query payload a client may send.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;
/// Longest header or row line accepted on the wire, including the newline.
///
/// The backend echoes a plain query back as `<conn id>\t<payload>\n`, so a
/// line has room for a full payload plus a `u64` id.
pub const MAX_LINE_LEN: usize = MAX_PAYLOAD_LEN + 64;
/// Most rows a single result frame may declare.
pub const MAX_ROWS: usize = 100_000;
/// Largest response the TCP driver buffers for one request.
pub const MAX_RESPONSE_LEN: usize = 64 * 1024 * 1024;

/// Socket read chunk size.
pub const READ_CHUNK: usize = 4096;

const _: () = assert!(
    MAX_LINE_LEN >= MAX_PAYLOAD_LEN + 22,
    "an echoed row must fit one line"
);
