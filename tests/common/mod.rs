#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use pollq::ConnectParams;
use pollq::backend::BackendServer;
use pollq::clock::Clock;
use pollq::driver::{ConnId, Connection, Driver, Readiness};
use pollq::error::{ConnectError, ReapError};

/// Everything the stub driver saw, shared between the driver and the test.
#[derive(Debug, Default)]
pub struct StubLog {
    pub opened: Vec<ConnId>,
    pub closed: Vec<ConnId>,
    pub submitted: Vec<(ConnId, String)>,
    pub polls: usize,
}

impl StubLog {
    pub fn all_closed(&self) -> bool {
        let mut opened = self.opened.clone();
        let mut closed = self.closed.clone();
        opened.sort();
        closed.sort();
        opened == closed
    }
}

/// Test clock advanced by hand or by the stub driver on every poll.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

/// Connection scripted by its payload:
///
/// - `ok:TAG` yields `TAG`
/// - `err:MSG` fails to reap with `MSG`
/// - `malformed` reaps a malformed result
/// - `reject` is reported rejected by poll
/// - `broken` is reported errored by poll
/// - `nosubmit` fails to submit
/// - `hang` never becomes ready
/// - anything else yields the payload itself
pub struct StubConn {
    id: ConnId,
    payload: Option<String>,
    polls_seen: usize,
    error: Option<String>,
    log: Rc<RefCell<StubLog>>,
}

impl Connection for StubConn {
    type Output = String;

    fn id(&self) -> ConnId {
        self.id
    }

    fn submit(&mut self, payload: &str) -> io::Result<()> {
        if payload == "nosubmit" {
            self.error = Some("stub refused submit".into());
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stub refused submit"));
        }
        self.payload = Some(payload.to_string());
        self.log
            .borrow_mut()
            .submitted
            .push((self.id, payload.to_string()));
        Ok(())
    }

    fn reap(&mut self) -> Result<String, ReapError> {
        let payload = self.payload.take().unwrap_or_default();
        if let Some(tag) = payload.strip_prefix("ok:") {
            Ok(tag.to_string())
        } else if let Some(msg) = payload.strip_prefix("err:") {
            Err(ReapError::Failed(msg.to_string()))
        } else if payload == "malformed" {
            Err(ReapError::Malformed)
        } else {
            Ok(payload)
        }
    }

    fn last_error(&self) -> Option<String> {
        self.error.clone()
    }

    fn close(self) -> io::Result<()> {
        self.log.borrow_mut().closed.push(self.id);
        Ok(())
    }
}

pub struct StubDriver {
    log: Rc<RefCell<StubLog>>,
    enabled: bool,
    next_id: u64,
    connects: usize,
    fail_connect_at: Option<usize>,
    reuse_ids: bool,
    ready_after: usize,
    fail_poll: bool,
    clock: Option<(ManualClock, u64)>,
}

impl StubDriver {
    pub fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(StubLog::default())),
            enabled: true,
            next_id: 0,
            connects: 0,
            fail_connect_at: None,
            reuse_ids: false,
            ready_after: 1,
            fail_poll: false,
            clock: None,
        }
    }

    pub fn log(&self) -> Rc<RefCell<StubLog>> {
        self.log.clone()
    }

    /// Report no async capability.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The `k`-th connect (1-based) fails.
    pub fn fail_connect_at(mut self, k: usize) -> Self {
        self.fail_connect_at = Some(k);
        self
    }

    /// Every connection gets the same id.
    pub fn reuse_ids(mut self) -> Self {
        self.reuse_ids = true;
        self
    }

    /// Connections become ready on the `n`-th poll that includes them.
    pub fn ready_after(mut self, n: usize) -> Self {
        self.ready_after = n.max(1);
        self
    }

    pub fn fail_poll(mut self) -> Self {
        self.fail_poll = true;
        self
    }

    /// Advance `clock` by `ms` on every poll.
    pub fn ticking(mut self, clock: ManualClock, ms: u64) -> Self {
        self.clock = Some((clock, ms));
        self
    }
}

impl Driver for StubDriver {
    type Conn = StubConn;

    fn supports_async(&self) -> bool {
        self.enabled
    }

    fn connect(&mut self) -> Result<StubConn, ConnectError> {
        self.connects += 1;
        if self.fail_connect_at == Some(self.connects) {
            return Err(ConnectError::Rejected("stub connect failure".into()));
        }
        if !self.reuse_ids || self.next_id == 0 {
            self.next_id += 1;
        }
        let id = ConnId(self.next_id);
        self.log.borrow_mut().opened.push(id);
        Ok(StubConn {
            id,
            payload: None,
            polls_seen: 0,
            error: None,
            log: self.log.clone(),
        })
    }

    fn poll<'c, I>(&mut self, conns: I, _wait: Duration) -> io::Result<Readiness>
    where
        I: Iterator<Item = &'c mut StubConn>,
    {
        self.log.borrow_mut().polls += 1;
        if let Some((clock, ms)) = &self.clock {
            clock.advance(*ms);
        }
        if self.fail_poll {
            return Err(io::Error::other("stub poll failure"));
        }

        let mut ready = Readiness::default();
        for conn in conns {
            conn.polls_seen += 1;
            let Some(payload) = conn.payload.as_deref() else {
                ready.rejected.push(conn.id);
                continue;
            };
            match payload {
                "reject" => ready.rejected.push(conn.id),
                "broken" => {
                    conn.error = Some("broken pipe".into());
                    ready.errored.push(conn.id);
                }
                "hang" => {}
                _ if conn.polls_seen >= self.ready_after => ready.readable.push(conn.id),
                _ => {}
            }
        }
        Ok(ready)
    }
}

/// Start an in-process backend on an ephemeral loopback port.
pub fn spawn_backend(base_delay: Duration) -> SocketAddr {
    let server = BackendServer::bind("127.0.0.1:0".parse().unwrap(), base_delay)
        .expect("failed to bind backend");
    let (addr, _handle) = server.spawn().expect("failed to spawn backend");
    addr
}

pub fn params_for(addr: SocketAddr) -> ConnectParams {
    ConnectParams {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout: Duration::from_secs(2),
        ..ConnectParams::default()
    }
}
