//! TCP driver: one socket per request, readiness via `poll(2)`.
//!
//! Connect and handshake are blocking and bounded by `connect_timeout`.
//! After that, the socket is non-blocking. Submission writes what the kernel
//! accepts and leaves the rest for `POLLOUT`. Responses accumulate in a
//! per-connection buffer during polls, so `reap` only parses what is already there.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config::ConnectParams;
use crate::constants::{MAX_RESPONSE_LEN, READ_CHUNK};
use crate::driver::{ConnId, Connection, Driver, Readiness};
use crate::error::{ConnectError, ReapError};
use crate::protocol::{self, ParseResult, ServerFrame};

/// Rows returned by one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSet {
    conn: ConnId,
    rows: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn new(conn: ConnId, rows: Vec<Vec<String>>) -> Self {
        Self { conn, rows }
    }

    /// Connection the result arrived on.
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn first_row(&self) -> Option<&[String]> {
        self.rows.first().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Submitted,
    Reaped,
}

pub struct TcpConnection {
    id: ConnId,
    stream: TcpStream,
    state: State,
    write_buf: Vec<u8>,
    write_pos: usize,
    read_buf: Vec<u8>,
    eof: bool,
    error: Option<String>,
}

impl TcpConnection {
    /// Connect, authenticate and switch the socket to non-blocking mode.
    pub fn open(params: &ConnectParams) -> Result<Self, ConnectError> {
        let target = params.addr_string();
        let addr = target
            .to_socket_addrs()
            .map_err(|_| ConnectError::Resolve(target.clone()))?
            .next()
            .ok_or_else(|| ConnectError::Resolve(target.clone()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&addr.into(), params.connect_timeout)?;
        socket.set_nodelay(true)?;
        let mut stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(params.connect_timeout))?;
        stream.set_write_timeout(Some(params.connect_timeout))?;

        let mut hello = Vec::new();
        protocol::write_hello(&mut hello, &params.user, &params.passwd, &params.dbname);
        stream.write_all(&hello)?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let id = loop {
            match protocol::try_parse_server_frame(&buf) {
                ParseResult::Complete {
                    value: ServerFrame::Welcome(id),
                    bytes_consumed,
                } => {
                    if bytes_consumed != buf.len() {
                        return Err(ConnectError::Handshake("trailing bytes after welcome"));
                    }
                    break id;
                }
                ParseResult::Complete {
                    value: ServerFrame::Error(msg),
                    ..
                } => return Err(ConnectError::Rejected(msg)),
                ParseResult::Complete { .. } => {
                    return Err(ConnectError::Handshake("expected welcome frame"));
                }
                ParseResult::Error(e) => return Err(ConnectError::Handshake(e)),
                ParseResult::Incomplete(_) => {
                    let n = stream.read(&mut chunk)?;
                    if n == 0 {
                        return Err(ConnectError::Handshake("connection closed during handshake"));
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        };

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        stream.set_nonblocking(true)?;

        Ok(Self {
            id,
            stream,
            state: State::Idle,
            write_buf: Vec::with_capacity(256),
            write_pos: 0,
            read_buf: Vec::new(),
            eof: false,
            error: None,
        })
    }

    fn interest(&self) -> libc::c_short {
        if self.write_pos < self.write_buf.len() {
            libc::POLLIN | libc::POLLOUT
        } else {
            libc::POLLIN
        }
    }

    /// Write as much of the pending request as the socket takes.
    fn flush_pending(&mut self) -> io::Result<()> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "backend stopped accepting data",
                    ));
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drain the socket into the read buffer. True once the response can be reaped.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if self.read_buf.len() > MAX_RESPONSE_LEN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response too large",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.response_ready())
    }

    fn response_ready(&self) -> bool {
        self.eof
            || !matches!(
                protocol::try_parse_server_frame(&self.read_buf),
                ParseResult::Incomplete(_)
            )
    }

    fn fail(&mut self, e: &io::Error) {
        self.error = Some(e.to_string());
    }

    /// Send `payload` and wait for its response with blocking I/O.
    ///
    /// Leaves the socket in blocking mode; meant for connections that never
    /// go back to a [`TcpDriver`] poll.
    pub fn query_blocking(&mut self, payload: &str) -> Result<ResultSet, ReapError> {
        self.state = State::Idle;
        if let Err(e) = self.exchange_blocking(payload) {
            self.fail(&e);
            return Err(ReapError::Failed(e.to_string()));
        }
        self.reap()
    }

    fn exchange_blocking(&mut self, payload: &str) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        self.submit(payload)?;
        let mut chunk = [0u8; READ_CHUNK];
        while !self.response_ready() {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.read_buf.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }
}

impl Connection for TcpConnection {
    type Output = ResultSet;

    fn id(&self) -> ConnId {
        self.id
    }

    fn submit(&mut self, payload: &str) -> io::Result<()> {
        if self.state != State::Idle {
            return Err(io::Error::other("request already submitted on this connection"));
        }
        self.write_buf.clear();
        self.write_pos = 0;
        self.read_buf.clear();
        self.eof = false;
        protocol::write_query(&mut self.write_buf, payload);
        self.state = State::Submitted;

        if let Err(e) = self.flush_pending() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    fn reap(&mut self) -> Result<ResultSet, ReapError> {
        if self.state != State::Submitted {
            return Err(ReapError::Failed("no outstanding request".to_string()));
        }
        self.state = State::Reaped;

        match protocol::try_parse_server_frame(&self.read_buf) {
            ParseResult::Complete {
                value: ServerFrame::Rows(rows),
                ..
            } => Ok(ResultSet::new(self.id, rows)),
            ParseResult::Complete {
                value: ServerFrame::Error(msg),
                ..
            } => {
                self.error = Some(msg.clone());
                Err(ReapError::Failed(msg))
            }
            ParseResult::Complete {
                value: ServerFrame::Welcome(_),
                ..
            }
            | ParseResult::Error(_) => Err(ReapError::Malformed),
            ParseResult::Incomplete(_) => {
                let msg = if self.eof {
                    "connection closed by backend"
                } else {
                    "response not ready"
                };
                self.error = Some(msg.to_string());
                Err(ReapError::Failed(msg.to_string()))
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.error.clone()
    }

    fn close(self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Opens [`TcpConnection`]s to one backend and multiplexes them with `poll(2)`.
pub struct TcpDriver {
    params: ConnectParams,
}

impl TcpDriver {
    pub fn new(params: ConnectParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }
}

/// Probe `poll(2)` with an empty set and a zero timeout.
fn poll_available() -> bool {
    // SAFETY: nfds is 0, so the null array is never dereferenced.
    let rc = unsafe { libc::poll(std::ptr::null_mut(), 0, 0) };
    rc == 0
}

/// Round up to whole milliseconds so a sub-millisecond wait still blocks.
fn poll_timeout_ms(wait: Duration) -> libc::c_int {
    wait.as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

impl Driver for TcpDriver {
    type Conn = TcpConnection;

    fn supports_async(&self) -> bool {
        poll_available()
    }

    fn connect(&mut self) -> Result<TcpConnection, ConnectError> {
        let conn = TcpConnection::open(&self.params)?;
        debug!(conn = %conn.id, addr = %self.params.addr_string(), "connected");
        Ok(conn)
    }

    fn poll<'c, I>(&mut self, conns: I, wait: Duration) -> io::Result<Readiness>
    where
        I: Iterator<Item = &'c mut TcpConnection>,
    {
        let mut ready = Readiness::default();
        let mut active: Vec<&'c mut TcpConnection> = Vec::new();
        for conn in conns {
            if conn.state == State::Submitted {
                active.push(conn);
            } else {
                ready.rejected.push(conn.id);
            }
        }
        if !ready.is_empty() || active.is_empty() {
            return Ok(ready);
        }

        let deadline = Instant::now() + wait;
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(active.len());
        loop {
            fds.clear();
            fds.extend(active.iter().map(|c| libc::pollfd {
                fd: c.stream.as_raw_fd(),
                events: c.interest(),
                revents: 0,
            }));
            let timeout = poll_timeout_ms(deadline.saturating_duration_since(Instant::now()));

            // SAFETY: `fds` is a live array of `fds.len()` pollfd entries for the whole call.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            if rc > 0 {
                for (pfd, conn) in fds.iter().zip(active.iter_mut()) {
                    let revents = pfd.revents;
                    if revents == 0 {
                        continue;
                    }
                    if revents & libc::POLLNVAL != 0 {
                        ready.rejected.push(conn.id);
                        continue;
                    }
                    if revents & libc::POLLERR != 0 {
                        conn.error = Some(match conn.stream.take_error() {
                            Ok(Some(e)) | Err(e) => e.to_string(),
                            Ok(None) => "socket error".to_string(),
                        });
                        ready.errored.push(conn.id);
                        continue;
                    }
                    if revents & libc::POLLOUT != 0 {
                        if let Err(e) = conn.flush_pending() {
                            conn.fail(&e);
                            ready.errored.push(conn.id);
                            continue;
                        }
                    }
                    if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                        match conn.fill() {
                            Ok(true) => ready.readable.push(conn.id),
                            Ok(false) => {}
                            Err(e) => {
                                conn.fail(&e);
                                ready.errored.push(conn.id);
                            }
                        }
                    }
                }
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }

            if Instant::now() >= deadline {
                return Ok(ready);
            }
        }
    }
}
