#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Batches (cumulative)
    static BATCHES_STARTED: AtomicU64 = AtomicU64::new(0);
    static BATCHES_FAILED: AtomicU64 = AtomicU64::new(0);
    // Requests (cumulative)
    static REQUESTS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_COMPLETED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_SERVED: AtomicU64 = AtomicU64::new(0);
    // Readiness poll outcomes (stall = nothing ready)
    static POLL_EVENTS: AtomicU64 = AtomicU64::new(0);
    static POLL_NO_EVENTS: AtomicU64 = AtomicU64::new(0);
    // Connection lifecycle
    static CONNS_OPENED: AtomicU64 = AtomicU64::new(0);
    static CONNS_CLOSED: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static INFLIGHT: AtomicUsize = AtomicUsize::new(0);
    static INFLIGHT_MAX: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Copy)]
    pub struct MetricsSnapshot {
        pub batches_started: u64,
        pub batches_failed: u64,
        pub requests_submitted: u64,
        pub requests_completed: u64,
        pub requests_served: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
        pub conns_opened: u64,
        pub conns_closed: u64,
        pub inflight: usize,
        pub inflight_max: usize,
    }

    pub fn inc_batches_started() {
        BATCHES_STARTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_failed() {
        BATCHES_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_submitted() {
        REQUESTS_SUBMITTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_completed() {
        REQUESTS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_served() {
        REQUESTS_SERVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_events() {
        POLL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_no_events() {
        POLL_NO_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conns_opened() {
        CONNS_OPENED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conns_closed() {
        CONNS_CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_inflight() {
        let v = INFLIGHT.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&INFLIGHT_MAX, v);
    }

    pub fn dec_inflight() {
        INFLIGHT.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            batches_started: BATCHES_STARTED.load(Ordering::Relaxed),
            batches_failed: BATCHES_FAILED.load(Ordering::Relaxed),
            requests_submitted: REQUESTS_SUBMITTED.load(Ordering::Relaxed),
            requests_completed: REQUESTS_COMPLETED.load(Ordering::Relaxed),
            requests_served: REQUESTS_SERVED.load(Ordering::Relaxed),
            poll_events: POLL_EVENTS.load(Ordering::Relaxed),
            poll_no_events: POLL_NO_EVENTS.load(Ordering::Relaxed),
            conns_opened: CONNS_OPENED.load(Ordering::Relaxed),
            conns_closed: CONNS_CLOSED.load(Ordering::Relaxed),
            inflight: INFLIGHT.load(Ordering::Relaxed),
            inflight_max: INFLIGHT_MAX.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last_snap = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                let poll_ev_d = snap.poll_events.saturating_sub(last_snap.poll_events);
                let poll_no_d = snap.poll_no_events.saturating_sub(last_snap.poll_no_events);
                let total_poll = poll_ev_d + poll_no_d;
                let stall_pct = if total_poll > 0 {
                    100.0 * (poll_no_d as f64 / total_poll as f64)
                } else {
                    0.0
                };
                tracing::info!(
                    interval_secs = INTERVAL_SECS,
                    batches = snap.batches_started.saturating_sub(last_snap.batches_started),
                    batches_failed = snap.batches_failed.saturating_sub(last_snap.batches_failed),
                    submitted = snap
                        .requests_submitted
                        .saturating_sub(last_snap.requests_submitted),
                    completed = snap
                        .requests_completed
                        .saturating_sub(last_snap.requests_completed),
                    served = snap.requests_served.saturating_sub(last_snap.requests_served),
                    opened = snap.conns_opened.saturating_sub(last_snap.conns_opened),
                    closed = snap.conns_closed.saturating_sub(last_snap.conns_closed),
                    stall_pct = %format!("{stall_pct:.1}"),
                    inflight = snap.inflight,
                    inflight_max = snap.inflight_max,
                    "metrics delta"
                );
                last_snap = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Debug, Clone, Copy)]
    pub struct MetricsSnapshot {
        pub batches_started: u64,
        pub batches_failed: u64,
        pub requests_submitted: u64,
        pub requests_completed: u64,
        pub requests_served: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
        pub conns_opened: u64,
        pub conns_closed: u64,
        pub inflight: usize,
        pub inflight_max: usize,
    }

    pub fn inc_batches_started() {}
    pub fn inc_batches_failed() {}
    pub fn inc_requests_submitted() {}
    pub fn inc_requests_completed() {}
    pub fn inc_requests_served() {}
    pub fn inc_poll_events() {}
    pub fn inc_poll_no_events() {}
    pub fn inc_conns_opened() {}
    pub fn inc_conns_closed() {}
    pub fn inc_inflight() {}
    pub fn dec_inflight() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            batches_started: 0,
            batches_failed: 0,
            requests_submitted: 0,
            requests_completed: 0,
            requests_served: 0,
            poll_events: 0,
            poll_no_events: 0,
            conns_opened: 0,
            conns_closed: 0,
            inflight: 0,
            inflight_max: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
