//! Single-threaded query backend speaking the line protocol.
//!
//! Every session sits in one slab and one `poll(2)` loop serves all of them.
//! It exists so the driver, the CLI and the benches have something real to
//! talk to. "Executing" a query just means scheduling a canned reply after a
//! delay:
//!
//! - `SLEEP <ms>`: one row `slept, <ms>` after `ms`
//! - `FAIL <msg>`: error frame
//! - `MALFORMED`: an invalid frame
//! - `DISCONNECT`: drop the session without replying
//! - anything else: one row `<conn id>, <payload>` after the base delay

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::constants::READ_CHUNK;
use crate::driver::ConnId;
use crate::metrics;
use crate::protocol::{self, ClientFrame, ParseResult};

/// Max concurrent sessions.
const SLAB_CAPACITY: usize = 4096;

/// Poll timeout when no reply is scheduled.
const IDLE_POLL_MS: libc::c_int = 1000;

/// Bytes the backend answers `MALFORMED` with.
const MALFORMED_FRAME: &[u8] = b"?\n";

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Frame(Vec<u8>),
    Disconnect,
}

/// Decide what `payload` answers and after how long.
pub(crate) fn evaluate(conn: ConnId, payload: &str, base_delay: Duration) -> (Duration, Reply) {
    let trimmed = payload.trim();
    let (cmd, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (trimmed, ""),
    };

    let mut frame = Vec::new();
    match cmd.to_ascii_uppercase().as_str() {
        "SLEEP" => match arg.parse::<u64>() {
            Ok(ms) => {
                protocol::write_rows(&mut frame, &[vec!["slept".to_string(), ms.to_string()]]);
                (Duration::from_millis(ms), Reply::Frame(frame))
            }
            Err(_) => {
                protocol::write_error(&mut frame, "SLEEP needs a duration in milliseconds");
                (base_delay, Reply::Frame(frame))
            }
        },
        "FAIL" => {
            let msg = if arg.is_empty() { "query failed" } else { arg };
            protocol::write_error(&mut frame, msg);
            (base_delay, Reply::Frame(frame))
        }
        "MALFORMED" => (base_delay, Reply::Frame(MALFORMED_FRAME.to_vec())),
        "DISCONNECT" => (base_delay, Reply::Disconnect),
        _ => {
            protocol::write_rows(&mut frame, &[vec![conn.to_string(), payload.to_string()]]);
            (base_delay, Reply::Frame(frame))
        }
    }
}

struct Scheduled {
    due: Instant,
    reply: Reply,
}

struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    id: Option<ConnId>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    scheduled: VecDeque<Scheduled>,
    close_after_flush: bool,
}

impl Session {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            id: None,
            read_buf: Vec::with_capacity(READ_CHUNK),
            write_buf: Vec::with_capacity(256),
            write_pos: 0,
            scheduled: VecDeque::new(),
            close_after_flush: false,
        }
    }

    fn pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    fn interest(&self) -> libc::c_short {
        if self.pending_write() {
            libc::POLLIN | libc::POLLOUT
        } else {
            libc::POLLIN
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.front().map(|s| s.due)
    }

    /// Replies leave in request order, so a reply is never due before the one ahead of it.
    fn schedule(&mut self, delay: Duration, reply: Reply) {
        let mut due = Instant::now() + delay;
        if let Some(last) = self.scheduled.back() {
            due = due.max(last.due);
        }
        self.scheduled.push_back(Scheduled { due, reply });
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.pending_write() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(())
    }

    /// Read and handle whatever the client sent. False means drop the session.
    fn on_readable(&mut self, ctx: &mut ServeContext) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "read failed");
                    return false;
                }
            }
        }

        let mut consumed = 0;
        while consumed < self.read_buf.len() && !self.close_after_flush {
            match protocol::try_parse_client_frame(&self.read_buf[consumed..]) {
                ParseResult::Complete {
                    value,
                    bytes_consumed,
                } => {
                    consumed += bytes_consumed;
                    self.on_frame(value, ctx);
                }
                ParseResult::Incomplete(_) => break,
                ParseResult::Error(e) => {
                    protocol::write_error(&mut self.write_buf, e);
                    self.close_after_flush = true;
                }
            }
        }
        self.read_buf.drain(..consumed);

        self.flush().is_ok()
    }

    fn on_frame(&mut self, frame: ClientFrame, ctx: &mut ServeContext) {
        match (frame, self.id) {
            (ClientFrame::Hello { user, dbname, .. }, None) => {
                if user.is_empty() {
                    protocol::write_error(&mut self.write_buf, "access denied for user ''");
                    self.close_after_flush = true;
                    return;
                }
                let id = ctx.next_id();
                self.id = Some(id);
                protocol::write_welcome(&mut self.write_buf, id);
                debug!(conn = %id, peer = %self.peer, user = %user, dbname = %dbname, "session authenticated");
            }
            (ClientFrame::Hello { .. }, Some(_)) => {
                protocol::write_error(&mut self.write_buf, "already authenticated");
                self.close_after_flush = true;
            }
            (ClientFrame::Query(_), None) => {
                protocol::write_error(&mut self.write_buf, "handshake required");
                self.close_after_flush = true;
            }
            (ClientFrame::Query(payload), Some(id)) => {
                let (delay, reply) = evaluate(id, &payload, ctx.base_delay);
                self.schedule(delay, reply);
            }
        }
    }

    /// Move due replies into the write buffer. False means drop the session.
    fn deliver_due(&mut self, now: Instant) -> bool {
        while self.scheduled.front().is_some_and(|s| s.due <= now) {
            let Some(next) = self.scheduled.pop_front() else {
                break;
            };
            match next.reply {
                Reply::Frame(bytes) => {
                    self.write_buf.extend_from_slice(&bytes);
                    metrics::inc_requests_served();
                }
                Reply::Disconnect => return false,
            }
        }
        self.flush().is_ok()
    }
}

struct ServeContext {
    base_delay: Duration,
    next_id: u64,
}

impl ServeContext {
    fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }
}

pub struct BackendServer {
    listener: TcpListener,
    ctx: ServeContext,
}

impl BackendServer {
    /// Listen on `addr`. Port 0 picks a free port; see [`BackendServer::local_addr`].
    pub fn bind(addr: SocketAddr, base_delay: Duration) -> io::Result<Self> {
        Ok(Self {
            listener: create_listener(addr)?,
            ctx: ServeContext {
                base_delay,
                next_id: 0,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever on a background thread named `backend`.
    pub fn spawn(self) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
        let addr = self.local_addr()?;
        let handle = thread::Builder::new()
            .name("backend".into())
            .spawn(move || self.run())?;
        Ok((addr, handle))
    }

    /// Serve until the poll primitive itself fails.
    pub fn run(mut self) -> io::Result<()> {
        let mut sessions: Slab<Session> = Slab::with_capacity(SLAB_CAPACITY);
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut keys: Vec<usize> = Vec::new();
        info!(addr = %self.local_addr()?, base_delay_ms = self.ctx.base_delay.as_millis() as u64, "backend listening");

        loop {
            self.turn(&mut sessions, &mut fds, &mut keys)?;
        }
    }

    fn turn(
        &mut self,
        sessions: &mut Slab<Session>,
        fds: &mut Vec<libc::pollfd>,
        keys: &mut Vec<usize>,
    ) -> io::Result<()> {
        fds.clear();
        keys.clear();
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (key, session) in sessions.iter() {
            fds.push(libc::pollfd {
                fd: session.stream.as_raw_fd(),
                events: session.interest(),
                revents: 0,
            });
            keys.push(key);
        }

        let now = Instant::now();
        let timeout = sessions
            .iter()
            .filter_map(|(_, s)| s.next_due())
            .min()
            .map(|due| {
                due.saturating_duration_since(now)
                    .as_micros()
                    .div_ceil(1000)
                    .min(IDLE_POLL_MS as u128) as libc::c_int
            })
            .unwrap_or(IDLE_POLL_MS);

        // SAFETY: `fds` is a live array of `fds.len()` pollfd entries for the whole call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_all(sessions);
        }

        for (pfd, &key) in fds[1..].iter().zip(keys.iter()) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            let session = &mut sessions[key];
            let keep = if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                false
            } else {
                let mut keep = true;
                if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                    keep = session.on_readable(&mut self.ctx);
                }
                if keep && revents & libc::POLLOUT != 0 {
                    keep = session.flush().is_ok();
                }
                keep
            };
            if !keep {
                let session = sessions.remove(key);
                debug!(conn = ?session.id, peer = %session.peer, "session closed");
            }
        }

        let now = Instant::now();
        let mut finished = Vec::new();
        for (key, session) in sessions.iter_mut() {
            let keep = session.deliver_due(now);
            if !keep || (session.close_after_flush && !session.pending_write()) {
                finished.push(key);
            }
        }
        for key in finished {
            let session = sessions.remove(key);
            debug!(conn = ?session.id, peer = %session.peer, "session closed");
        }
        Ok(())
    }

    fn accept_all(&mut self, sessions: &mut Slab<Session>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if sessions.len() >= SLAB_CAPACITY {
                        warn!(%peer, max = SLAB_CAPACITY, "rejecting connection: session limit reached");
                        continue;
                    }
                    if let Err(e) = stream
                        .set_nonblocking(true)
                        .and_then(|()| stream.set_nodelay(true))
                    {
                        warn!(%peer, error = %e, "failed to configure accepted socket");
                        continue;
                    }
                    let key = sessions.insert(Session::new(stream, peer));
                    debug!(%peer, key, "accepted connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }
}
