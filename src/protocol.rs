//! Line-framed wire protocol between the TCP driver and the backend.
//!
//! Client → server:
//! - `!user\tpasswd\tdbname\n`: handshake, first frame on every connection
//! - `#<len>\n<payload>`: query, `len` payload bytes follow the header
//!
//! Server → client:
//! - `@<conn id>\n`: handshake accepted
//! - `*<nrows>\n` followed by `nrows` lines of tab-separated columns
//! - `-<message>\n`: handshake or query failed

use std::borrow::Cow;

use crate::constants::{MAX_LINE_LEN, MAX_PAYLOAD_LEN, MAX_ROWS};
use crate::driver::ConnId;

/// Result of attempting to parse one frame from a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<T> {
    /// A whole frame, and how many bytes of the buffer it used.
    Complete { value: T, bytes_consumed: usize },
    /// Need more data. Contains a lower bound on the bytes still missing.
    Incomplete(usize),
    /// The bytes can never become a valid frame.
    Error(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Hello {
        user: String,
        passwd: String,
        dbname: String,
    },
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Welcome(ConnId),
    Rows(Vec<Vec<String>>),
    Error(String),
}

/// Split one `\n`-terminated line off the front of `buf`, without the newline.
fn take_line(buf: &[u8]) -> ParseResult<&str> {
    let window = &buf[..buf.len().min(MAX_LINE_LEN)];
    match window.iter().position(|&b| b == b'\n') {
        Some(end) => match std::str::from_utf8(&buf[..end]) {
            Ok(line) => ParseResult::Complete {
                value: line,
                bytes_consumed: end + 1,
            },
            Err(_) => ParseResult::Error("line is not utf-8"),
        },
        None if buf.len() >= MAX_LINE_LEN => ParseResult::Error("line too long"),
        None => ParseResult::Incomplete(1),
    }
}

pub fn try_parse_client_frame(buf: &[u8]) -> ParseResult<ClientFrame> {
    let Some(&tag) = buf.first() else {
        return ParseResult::Incomplete(1);
    };
    match tag {
        b'!' => match take_line(&buf[1..]) {
            ParseResult::Complete {
                value,
                bytes_consumed,
            } => {
                let mut fields = value.split('\t');
                match (fields.next(), fields.next(), fields.next(), fields.next()) {
                    (Some(user), Some(passwd), Some(dbname), None) => ParseResult::Complete {
                        value: ClientFrame::Hello {
                            user: user.to_string(),
                            passwd: passwd.to_string(),
                            dbname: dbname.to_string(),
                        },
                        bytes_consumed: 1 + bytes_consumed,
                    },
                    _ => ParseResult::Error("handshake needs user, passwd and dbname"),
                }
            }
            ParseResult::Incomplete(n) => ParseResult::Incomplete(n),
            ParseResult::Error(e) => ParseResult::Error(e),
        },
        b'#' => {
            let (len, header) = match take_line(&buf[1..]) {
                ParseResult::Complete {
                    value,
                    bytes_consumed,
                } => match value.parse::<usize>() {
                    Ok(len) if len <= MAX_PAYLOAD_LEN => (len, 1 + bytes_consumed),
                    Ok(_) => return ParseResult::Error("payload too large"),
                    Err(_) => return ParseResult::Error("bad payload length"),
                },
                ParseResult::Incomplete(n) => return ParseResult::Incomplete(n),
                ParseResult::Error(e) => return ParseResult::Error(e),
            };
            let total = header + len;
            if buf.len() < total {
                return ParseResult::Incomplete(total - buf.len());
            }
            match std::str::from_utf8(&buf[header..total]) {
                Ok(payload) => ParseResult::Complete {
                    value: ClientFrame::Query(payload.to_string()),
                    bytes_consumed: total,
                },
                Err(_) => ParseResult::Error("payload is not utf-8"),
            }
        }
        _ => ParseResult::Error("unknown client frame"),
    }
}

pub fn try_parse_server_frame(buf: &[u8]) -> ParseResult<ServerFrame> {
    let Some(&tag) = buf.first() else {
        return ParseResult::Incomplete(1);
    };
    let (header, mut consumed) = match take_line(&buf[1..]) {
        ParseResult::Complete {
            value,
            bytes_consumed,
        } => (value, 1 + bytes_consumed),
        ParseResult::Incomplete(n) => return ParseResult::Incomplete(n),
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    match tag {
        b'@' => match header.parse::<u64>() {
            Ok(id) => ParseResult::Complete {
                value: ServerFrame::Welcome(ConnId(id)),
                bytes_consumed: consumed,
            },
            Err(_) => ParseResult::Error("bad connection id"),
        },
        b'-' => ParseResult::Complete {
            value: ServerFrame::Error(header.to_string()),
            bytes_consumed: consumed,
        },
        b'*' => {
            let nrows = match header.parse::<usize>() {
                Ok(n) if n <= MAX_ROWS => n,
                Ok(_) => return ParseResult::Error("too many rows"),
                Err(_) => return ParseResult::Error("bad row count"),
            };
            let mut rows = Vec::with_capacity(nrows.min(1024));
            for _ in 0..nrows {
                match take_line(&buf[consumed..]) {
                    ParseResult::Complete {
                        value,
                        bytes_consumed,
                    } => {
                        rows.push(value.split('\t').map(str::to_string).collect());
                        consumed += bytes_consumed;
                    }
                    ParseResult::Incomplete(n) => return ParseResult::Incomplete(n),
                    ParseResult::Error(e) => return ParseResult::Error(e),
                }
            }
            ParseResult::Complete {
                value: ServerFrame::Rows(rows),
                bytes_consumed: consumed,
            }
        }
        _ => ParseResult::Error("unknown server frame"),
    }
}

/// Replace characters that would break framing.
fn sanitize(s: &str) -> Cow<'_, str> {
    if s.contains(['\t', '\n', '\r']) {
        Cow::Owned(s.replace(['\t', '\n', '\r'], " "))
    } else {
        Cow::Borrowed(s)
    }
}

pub fn write_hello(buf: &mut Vec<u8>, user: &str, passwd: &str, dbname: &str) {
    buf.push(b'!');
    buf.extend_from_slice(sanitize(user).as_bytes());
    buf.push(b'\t');
    buf.extend_from_slice(sanitize(passwd).as_bytes());
    buf.push(b'\t');
    buf.extend_from_slice(sanitize(dbname).as_bytes());
    buf.push(b'\n');
}

/// Query payloads are length-prefixed and sent verbatim.
pub fn write_query(buf: &mut Vec<u8>, payload: &str) {
    buf.push(b'#');
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(payload.as_bytes());
}

pub fn write_welcome(buf: &mut Vec<u8>, id: ConnId) {
    buf.push(b'@');
    buf.extend_from_slice(id.0.to_string().as_bytes());
    buf.push(b'\n');
}

/// Rows always carry at least one column on the wire: an empty row is
/// indistinguishable from a row holding one empty column and parses back as such.
pub fn write_rows<S: AsRef<str>>(buf: &mut Vec<u8>, rows: &[Vec<S>]) {
    buf.push(b'*');
    buf.extend_from_slice(rows.len().to_string().as_bytes());
    buf.push(b'\n');
    for row in rows {
        for (i, col) in row.iter().enumerate() {
            if i > 0 {
                buf.push(b'\t');
            }
            buf.extend_from_slice(sanitize(col.as_ref()).as_bytes());
        }
        buf.push(b'\n');
    }
}

pub fn write_error(buf: &mut Vec<u8>, message: &str) {
    buf.push(b'-');
    buf.extend_from_slice(sanitize(message).as_bytes());
    buf.push(b'\n');
}
