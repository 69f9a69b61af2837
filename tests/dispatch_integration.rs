//! Dispatcher behavior against a scripted driver: batching, failure and teardown.

mod common;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use pollq::driver::ConnId;
use pollq::error::{ConnectError, DispatchError};
use pollq::{DispatchConfig, Dispatcher};

use common::{ManualClock, StubDriver};

#[test]
fn queue_full_at_limit() {
    let config = DispatchConfig::default().with_limit(2);
    let mut dispatcher = Dispatcher::new(config, StubDriver::new());

    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("ok:b", None).unwrap();
    let err = dispatcher.enqueue("ok:c", None).unwrap_err();

    assert!(matches!(err, DispatchError::QueueFull { limit: 2 }));
    assert_eq!(dispatcher.queued(), 2);
    assert_eq!(dispatcher.last_error(), Some("over 2 queued requests"));
}

#[test]
fn empty_payload_rejected_and_queue_untouched() {
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    dispatcher.enqueue("ok:a", None).unwrap();

    let err = dispatcher.enqueue("", None).unwrap_err();
    assert!(matches!(err, DispatchError::EmptyPayload));
    assert_eq!(dispatcher.queued(), 1);
}

#[test]
fn run_on_empty_queue_opens_nothing() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);

    let err = dispatcher.run().unwrap_err();
    assert!(matches!(err, DispatchError::EmptyQueue));
    assert!(log.borrow().opened.is_empty());
    assert_eq!(log.borrow().polls, 0);
}

#[test]
fn every_callback_fires_once_with_its_own_result() {
    let results = RefCell::new(Vec::new());
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);

    for i in 0..5 {
        let results = &results;
        dispatcher
            .enqueue_with(format!("ok:tag-{i}"), move |r: &String| {
                results.borrow_mut().push((i, r.clone()))
            })
            .unwrap();
    }
    let stats = dispatcher.run().unwrap();

    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.completed, 5);
    let mut results = results.borrow().clone();
    results.sort();
    let expected: Vec<_> = (0..5).map(|i| (i, format!("tag-{i}"))).collect();
    assert_eq!(results, expected);

    let log = log.borrow();
    assert_eq!(log.opened.len(), 5);
    assert!(log.all_closed());
    assert_eq!(dispatcher.queued(), 0);
}

#[test]
fn requests_without_callback_still_complete() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("ok:b", None).unwrap();

    let stats = dispatcher.run().unwrap();
    assert_eq!(stats.completed, 2);
    assert!(log.borrow().all_closed());
}

#[test]
fn two_requests_complete_within_two_polls() {
    let results = RefCell::new(Vec::new());
    let driver = StubDriver::new().ready_after(2);
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);

    for payload in ["ok:R1", "ok:R2"] {
        let results = &results;
        dispatcher
            .enqueue_with(payload, move |r: &String| results.borrow_mut().push(r.clone()))
            .unwrap();
    }
    let stats = dispatcher.run().unwrap();

    assert!(stats.polls <= 2, "took {} polls", stats.polls);
    let mut results = results.borrow().clone();
    results.sort();
    assert_eq!(results, vec!["R1".to_string(), "R2".to_string()]);
    assert!(log.borrow().all_closed());
}

#[test]
fn connect_failure_closes_earlier_connections() {
    let fired = RefCell::new(0);
    let driver = StubDriver::new().fail_connect_at(3);
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);

    for i in 0..4 {
        let fired = &fired;
        dispatcher
            .enqueue_with(format!("ok:{i}"), move |_: &String| *fired.borrow_mut() += 1)
            .unwrap();
    }
    let err = dispatcher.run().unwrap_err();

    assert!(matches!(err, DispatchError::Connection(ConnectError::Rejected(_))));
    assert_eq!(*fired.borrow(), 0);
    let log = log.borrow();
    assert_eq!(log.opened, vec![ConnId(1), ConnId(2)]);
    assert!(log.all_closed());
    assert_eq!(log.polls, 0);
    assert_eq!(dispatcher.queued(), 0);
}

#[test]
fn timeout_closes_every_connection() {
    let clock = ManualClock::default();
    let driver = StubDriver::new().ticking(clock.clone(), 600);
    let log = driver.log();
    let config = DispatchConfig::default().with_timeout_secs(1.0);
    let fired = RefCell::new(Vec::new());
    let mut dispatcher = Dispatcher::with_clock(config, driver, clock);

    for payload in ["ok:fast", "hang"] {
        let fired = &fired;
        dispatcher
            .enqueue_with(payload, move |r: &String| fired.borrow_mut().push(r.clone()))
            .unwrap();
    }
    let err = dispatcher.run().unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Timeout {
            elapsed_ms: 1200,
            timeout_ms: 1000
        }
    ));
    assert_eq!(*fired.borrow(), vec!["fast".to_string()]);
    let log = log.borrow();
    assert_eq!(log.polls, 2);
    assert!(log.all_closed());
    assert!(dispatcher.last_error().unwrap().contains("timed out"));
}

#[test]
fn reset_is_idempotent() {
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("ok:b", None).unwrap();

    dispatcher.reset();
    dispatcher.reset();
    assert_eq!(dispatcher.queued(), 0);
    assert!(matches!(dispatcher.run(), Err(DispatchError::EmptyQueue)));
}

#[test]
fn disabled_dispatcher_refuses_everything() {
    let driver = StubDriver::new().disabled();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);

    assert!(!dispatcher.is_enabled());
    assert!(dispatcher.last_error().is_some());
    assert!(matches!(
        dispatcher.enqueue("ok:a", None),
        Err(DispatchError::CapabilityUnavailable)
    ));
    assert!(matches!(
        dispatcher.run(),
        Err(DispatchError::CapabilityUnavailable)
    ));
    assert!(log.borrow().opened.is_empty());

    assert!(matches!(
        Dispatcher::try_new(DispatchConfig::default(), StubDriver::new().disabled()),
        Err(DispatchError::CapabilityUnavailable)
    ));
}

#[test]
fn reap_failure_aborts_with_request_error() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("err:no such table", None).unwrap();
    dispatcher.enqueue("hang", None).unwrap();

    match dispatcher.run().unwrap_err() {
        DispatchError::Request { conn, detail } => {
            assert_eq!(conn, ConnId(1));
            assert_eq!(detail, "no such table");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(log.borrow().all_closed());
    assert_eq!(
        dispatcher.last_error(),
        Some("request failed on connection 1: no such table")
    );
}

#[test]
fn reap_failure_without_detail_uses_fallback() {
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    dispatcher.enqueue("err:", None).unwrap();

    match dispatcher.run().unwrap_err() {
        DispatchError::Request { detail, .. } => assert_eq!(detail, "get result error"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn malformed_result_aborts_with_result_error() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("malformed", None).unwrap();

    assert!(matches!(
        dispatcher.run(),
        Err(DispatchError::Result { conn: ConnId(2) })
    ));
    assert!(log.borrow().all_closed());
}

#[test]
fn rejected_connection_is_protocol_violation() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("reject", None).unwrap();

    assert!(matches!(
        dispatcher.run(),
        Err(DispatchError::ProtocolViolation { conn: ConnId(1) })
    ));
    assert!(log.borrow().all_closed());
}

#[test]
fn errored_connection_reports_its_last_error() {
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    dispatcher.enqueue("broken", None).unwrap();

    match dispatcher.run().unwrap_err() {
        DispatchError::Request { conn, detail } => {
            assert_eq!(conn, ConnId(1));
            assert_eq!(detail, "broken pipe");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn readable_connections_complete_before_errored_abort() {
    let fired = RefCell::new(0);
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    {
        let fired = &fired;
        dispatcher
            .enqueue_with("ok:a", move |_: &String| *fired.borrow_mut() += 1)
            .unwrap();
    }
    dispatcher.enqueue("broken", None).unwrap();

    assert!(matches!(dispatcher.run(), Err(DispatchError::Request { .. })));
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn submit_failure_closes_that_connection() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("nosubmit", None).unwrap();

    match dispatcher.run().unwrap_err() {
        DispatchError::Request { conn, detail } => {
            assert_eq!(conn, ConnId(2));
            assert_eq!(detail, "stub refused submit");
        }
        other => panic!("unexpected {other:?}"),
    }
    let log = log.borrow();
    assert_eq!(log.opened.len(), 2);
    assert!(log.all_closed());
}

#[test]
fn duplicate_connection_id_aborts_batch() {
    let driver = StubDriver::new().reuse_ids();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("ok:b", None).unwrap();

    assert!(matches!(
        dispatcher.run(),
        Err(DispatchError::Connection(ConnectError::DuplicateId(ConnId(1))))
    ));
    let log = log.borrow();
    assert_eq!(log.closed.len(), 2);
}

#[test]
fn poll_failure_aborts_batch() {
    let driver = StubDriver::new().fail_poll();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher.enqueue("ok:a", None).unwrap();

    assert!(matches!(dispatcher.run(), Err(DispatchError::Poll(_))));
    assert!(log.borrow().all_closed());
}

#[test]
fn callback_panic_still_closes_everything() {
    let driver = StubDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), driver);
    dispatcher
        .enqueue_with("ok:boom", |_: &String| panic!("callback exploded"))
        .unwrap();
    dispatcher.enqueue("hang", None).unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.run()));
    assert!(outcome.is_err());
    assert!(log.borrow().all_closed());
    assert_eq!(dispatcher.queued(), 0);

    dispatcher.enqueue("ok:again", None).unwrap();
    assert_eq!(dispatcher.run().unwrap().completed, 1);
}

#[test]
fn dispatcher_is_reusable_after_failure() {
    let mut dispatcher = Dispatcher::new(DispatchConfig::default(), StubDriver::new());
    dispatcher.enqueue("malformed", None).unwrap();
    assert!(dispatcher.run().is_err());
    let failure = dispatcher.last_error().map(str::to_string);

    dispatcher.enqueue("ok:a", None).unwrap();
    dispatcher.enqueue("ok:b", None).unwrap();
    let stats = dispatcher.run().unwrap();

    assert_eq!(stats.completed, 2);
    assert_eq!(dispatcher.last_error().map(str::to_string), failure);
}
