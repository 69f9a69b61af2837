//! Concurrent batch dispatch over a single control thread.
//!
//! `run` opens one connection per queued request, submits every request
//! without waiting, then polls the whole in-flight set until each request has
//! been reaped or the batch deadline passes. Any failure aborts the entire
//! batch: already-fired callbacks stay fired, everything still open is closed.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatchConfig;
use crate::driver::{ConnId, Connection, Driver, Output};
use crate::error::{ConnectError, DispatchError, ReapError};
use crate::metrics;
use crate::queue::{Callback, QueuedRequest, RequestQueue};

/// Summary of a completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub submitted: usize,
    pub completed: usize,
    /// Readiness polls issued, including ones that found nothing ready.
    pub polls: usize,
    /// Time spent in the readiness loop.
    pub elapsed_ms: u64,
}

struct InFlight<'cb, C: Connection> {
    conn: C,
    callback: Option<Callback<'cb, C::Output>>,
}

/// In-flight connections of one batch, keyed by connection id.
///
/// Connection and callback share one entry. Dropping the state closes
/// whatever is still tracked, so unwinding out of a callback leaks nothing.
pub(crate) struct EngineState<'cb, C: Connection> {
    in_flight: BTreeMap<ConnId, InFlight<'cb, C>>,
}

impl<'cb, C: Connection> EngineState<'cb, C> {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: BTreeMap::new(),
        }
    }

    /// Start tracking `conn`. Hands the connection back if its id is already tracked.
    pub(crate) fn track(
        &mut self,
        conn: C,
        callback: Option<Callback<'cb, C::Output>>,
    ) -> Result<(), C> {
        match self.in_flight.entry(conn.id()) {
            Entry::Vacant(slot) => {
                slot.insert(InFlight { conn, callback });
                metrics::inc_inflight();
                Ok(())
            }
            Entry::Occupied(_) => Err(conn),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }

    fn connections_mut(&mut self) -> impl Iterator<Item = &mut C> {
        self.in_flight.values_mut().map(|f| &mut f.conn)
    }

    fn last_error(&self, id: ConnId) -> Option<String> {
        self.in_flight.get(&id).and_then(|f| f.conn.last_error())
    }

    /// Reap `id`, fire its callback, then untrack and close it.
    ///
    /// Returns `Ok(false)` for an id that is not tracked.
    fn complete(&mut self, id: ConnId) -> Result<bool, DispatchError> {
        let Some(entry) = self.in_flight.get_mut(&id) else {
            warn!(conn = %id, "readiness reported for untracked connection");
            return Ok(false);
        };

        let result = match entry.conn.reap() {
            Ok(result) => result,
            Err(ReapError::Malformed) => return Err(DispatchError::Result { conn: id }),
            Err(ReapError::Failed(detail)) => {
                let detail = if detail.is_empty() {
                    entry
                        .conn
                        .last_error()
                        .unwrap_or_else(|| "get result error".to_string())
                } else {
                    detail
                };
                return Err(DispatchError::Request { conn: id, detail });
            }
        };

        // Still tracked while the callback runs: a panic here unwinds into Drop.
        if let Some(callback) = entry.callback.take() {
            callback(&result);
        }
        drop(result);

        if let Some(done) = self.in_flight.remove(&id) {
            metrics::dec_inflight();
            close_conn(done.conn);
        }
        metrics::inc_requests_completed();
        debug!(conn = %id, "request completed");
        Ok(true)
    }

    /// Close every tracked connection and forget it. Returns how many were closed.
    pub(crate) fn teardown(&mut self) -> usize {
        let in_flight = std::mem::take(&mut self.in_flight);
        let closed = in_flight.len();
        for (_, f) in in_flight {
            metrics::dec_inflight();
            close_conn(f.conn);
        }
        if closed > 0 {
            debug!(closed, "closed in-flight connections");
        }
        closed
    }
}

impl<C: Connection> Drop for EngineState<'_, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn close_conn<C: Connection>(conn: C) {
    let id = conn.id();
    if let Err(e) = conn.close() {
        debug!(conn = %id, error = %e, "close failed");
    }
    metrics::inc_conns_closed();
}

/// Queues requests and runs them as one concurrent batch.
///
/// Not reentrant: callers serialize `enqueue` and `run` themselves, which
/// `&mut self` already enforces within one thread.
pub struct Dispatcher<'cb, D: Driver, K: Clock = MonotonicClock> {
    driver: D,
    clock: K,
    config: DispatchConfig,
    enabled: bool,
    queue: RequestQueue<'cb, Output<D>>,
    last_error: Option<String>,
}

impl<'cb, D: Driver> Dispatcher<'cb, D> {
    /// Build a dispatcher. A driver without async support yields a disabled
    /// dispatcher whose every operation fails with `CapabilityUnavailable`.
    pub fn new(config: DispatchConfig, driver: D) -> Self {
        Self::with_clock(config, driver, MonotonicClock::new())
    }

    /// Like [`Dispatcher::new`], but refuses to build a disabled dispatcher.
    pub fn try_new(config: DispatchConfig, driver: D) -> Result<Self, DispatchError> {
        let dispatcher = Self::new(config, driver);
        if dispatcher.enabled {
            Ok(dispatcher)
        } else {
            Err(DispatchError::CapabilityUnavailable)
        }
    }
}

impl<'cb, D: Driver, K: Clock> Dispatcher<'cb, D, K> {
    pub fn with_clock(config: DispatchConfig, driver: D, clock: K) -> Self {
        let enabled = driver.supports_async();
        let last_error = if enabled {
            None
        } else {
            warn!("driver cannot multiplex non-blocking requests; dispatcher disabled");
            Some(DispatchError::CapabilityUnavailable.to_string())
        };
        Self {
            driver,
            clock,
            config,
            enabled,
            queue: RequestQueue::new(config.limit),
            last_error,
        }
    }

    /// Queue `payload` for the next batch, with an optional result callback.
    pub fn enqueue(
        &mut self,
        payload: impl Into<String>,
        callback: Option<Callback<'cb, Output<D>>>,
    ) -> Result<(), DispatchError> {
        let res = if self.enabled {
            self.queue.push(payload.into(), callback)
        } else {
            Err(DispatchError::CapabilityUnavailable)
        };
        self.record(res)
    }

    pub fn enqueue_with<F>(&mut self, payload: impl Into<String>, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&Output<D>) + 'cb,
    {
        self.enqueue(payload, Some(Box::new(callback)))
    }

    /// Dispatch every queued request concurrently and wait for all of them.
    ///
    /// The queue is empty afterwards and no connection opened here is left
    /// open, whatever the outcome.
    pub fn run(&mut self) -> Result<BatchStats, DispatchError> {
        let res = self.run_batch();
        if let Err(e) = &res {
            metrics::inc_batches_failed();
            warn!(error = %e, "batch aborted");
        }
        self.record(res)
    }

    fn run_batch(&mut self) -> Result<BatchStats, DispatchError> {
        if !self.enabled {
            return Err(DispatchError::CapabilityUnavailable);
        }
        if self.queue.is_empty() {
            return Err(DispatchError::EmptyQueue);
        }
        metrics::inc_batches_started();

        let requests = self.queue.take();
        let mut state = EngineState::new();
        for request in requests {
            self.submit(&mut state, request)?;
        }

        let submitted = state.len();
        let timeout_ms = self.config.timeout_ms();
        let start = self.clock.now_ms();
        let mut completed = 0;
        let mut polls = 0;
        info!(submitted, "batch dispatched");

        while completed < submitted {
            let elapsed_ms = self.clock.now_ms().saturating_sub(start);
            if elapsed_ms > timeout_ms {
                return Err(DispatchError::Timeout {
                    elapsed_ms,
                    timeout_ms,
                });
            }

            polls += 1;
            let ready = self
                .driver
                .poll(state.connections_mut(), self.config.block_interval)
                .map_err(DispatchError::Poll)?;
            if ready.is_empty() {
                metrics::inc_poll_no_events();
                continue;
            }
            metrics::inc_poll_events();

            for id in ready.readable {
                if state.complete(id)? {
                    completed += 1;
                }
            }
            if let Some(&conn) = ready.errored.first() {
                let detail = state
                    .last_error(conn)
                    .unwrap_or_else(|| "connection error".to_string());
                return Err(DispatchError::Request { conn, detail });
            }
            if let Some(&conn) = ready.rejected.first() {
                return Err(DispatchError::ProtocolViolation { conn });
            }
        }

        state.teardown();
        let elapsed_ms = self.clock.now_ms().saturating_sub(start);
        info!(completed, polls, elapsed_ms, "batch complete");
        Ok(BatchStats {
            submitted,
            completed,
            polls,
            elapsed_ms,
        })
    }

    fn submit(
        &mut self,
        state: &mut EngineState<'cb, D::Conn>,
        request: QueuedRequest<'cb, Output<D>>,
    ) -> Result<(), DispatchError> {
        let mut conn = self.driver.connect()?;
        metrics::inc_conns_opened();
        let id = conn.id();

        if let Err(e) = conn.submit(&request.payload) {
            let detail = conn.last_error().unwrap_or_else(|| e.to_string());
            close_conn(conn);
            return Err(DispatchError::Request { conn: id, detail });
        }
        if let Err(conn) = state.track(conn, request.callback) {
            close_conn(conn);
            return Err(ConnectError::DuplicateId(id).into());
        }

        metrics::inc_requests_submitted();
        debug!(conn = %id, payload_len = request.payload.len(), "submitted request");
        Ok(())
    }

    fn record<T>(&mut self, res: Result<T, DispatchError>) -> Result<T, DispatchError> {
        if let Err(e) = &res {
            self.last_error = Some(e.to_string());
        }
        res
    }

    /// Drop every queued request. Safe to call any number of times.
    pub fn reset(&mut self) {
        self.queue.clear();
    }

    /// Message of the most recent failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}
