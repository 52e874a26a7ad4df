//! Cancellation and expiration semantics.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use outrigger::prelude::*;

use common::{connected_pair, connected_pair_with, CountingMonitor};

#[test]
fn abort_races_reply_and_wins_exactly_once() {
    // The handler blocks on a barrier, so the reply cannot be sent before
    // the abort happened.
    let gate = Arc::new(Barrier::new(2));
    let release = gate.clone();
    let slow = Signature::<i32, (i32,)>::new("slow");
    let service = ServiceBuilder::new()
        .route(&slow, move |v: &i32| {
            release.wait();
            *v + 1
        })
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let (tx, rx) = flume::unbounded();
    let handle = slow
        .async_request(&pair.client, &(1,), move |outcome: Result<i32, RpcError>| {
            tx.send(outcome).unwrap();
        })
        .unwrap();

    assert!(handle.abort());
    assert!(!handle.abort()); // idempotent: the slot is already gone

    // the completion was invoked with Aborted, exactly once
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, Err(RpcError::Aborted));

    // let the peer send its (now stale) reply; it is silently discarded
    gate.wait();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!pair.client.expired());
}

#[test]
fn close_aborts_every_pending_request_exactly_once() {
    const PENDING: usize = 1000;

    // A client whose peer end never runs a session: requests pile up
    // unanswered in the pipe.
    let monitor = Arc::new(CountingMonitor::default());
    let exec = outrigger::worker::WorkerPool::new(4);
    let (client_end, _server_end) = outrigger::pipe::pipe();
    let client = SessionBuilder::new(client_end, MsgpackRpc::new(), exec)
        .enable_request()
        .monitor(monitor.clone())
        .build();

    let ping = Signature::<i32, (u64,)>::new("ping");
    let (tx, rx) = flume::unbounded();
    for index in 0..PENDING {
        let tx = tx.clone();
        ping.async_request(&client, &(index as u64,), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    }

    assert!(client.close());
    assert!(!client.close()); // double close is benign

    for _ in 0..PENDING {
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Err(RpcError::Aborted));
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while monitor.expired.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "expiration not reported");
        std::thread::yield_now();
    }
    assert_eq!(monitor.expired.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.created.load(Ordering::SeqCst), 1);
}

#[test]
fn peer_close_expires_the_session_and_aborts_pending() {
    let entered = Arc::new(Barrier::new(2));
    let gate = Arc::new(Barrier::new(2));
    let notify_entry = entered.clone();
    let release = gate.clone();
    let slow = Signature::<i32, ()>::new("slow");
    let service = ServiceBuilder::new()
        .route(&slow, move || -> i32 {
            notify_entry.wait();
            release.wait();
            1
        })
        .unwrap()
        .build();

    let monitor = Arc::new(CountingMonitor::default());
    let pair = connected_pair_with(service, monitor.clone(), Arc::new(NullMonitor));

    let (tx, rx) = flume::unbounded();
    pair.client
        .async_request_views(
            "slow",
            &[],
            Some(BoxedObject::new(0i32)),
            Box::new(move |outcome| {
                let _ = tx.send(outcome.map(|_| ()));
            }),
        )
        .unwrap();

    // Tear the server down while the handler is provably mid-flight; the
    // client observes the closed stream and expires.
    entered.wait();
    pair.server.close();
    gate.wait();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, Err(RpcError::Aborted));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !pair.client.expired() {
        assert!(std::time::Instant::now() < deadline, "client never expired");
        std::thread::yield_now();
    }
    assert_eq!(monitor.expired.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_returns_after_completion_ran() {
    let double = Signature::<i64, (i64,)>::new("double");
    let service = ServiceBuilder::new()
        .route(&double, |v: &i64| v * 2)
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let cell = Arc::new(parking_lot::Mutex::new(None));
    let slot = cell.clone();
    let handle = double
        .async_request(&pair.client, &(21,), move |outcome| {
            *slot.lock() = Some(outcome);
        })
        .unwrap();

    handle.wait();
    // wait() returning guarantees the completion already ran
    assert_eq!(cell.lock().take().unwrap().unwrap(), 42);
}

#[test]
fn aborting_a_completed_request_is_a_no_op() {
    let double = Signature::<i64, (i64,)>::new("double");
    let service = ServiceBuilder::new()
        .route(&double, |v: &i64| v * 2)
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let (tx, rx) = flume::unbounded();
    let handle = double
        .async_request(&pair.client, &(5,), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();
    handle.wait();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(10));

    // the slot is gone; aborting now has no effect
    assert!(!handle.abort());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}
