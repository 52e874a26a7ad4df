//! Notify semantics and group fan-out.

mod common;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use outrigger::pipe::pipe;
use outrigger::prelude::*;
use outrigger::worker::WorkerPool;

use common::connected_pair;

fn wait_until(deadline_secs: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(deadline_secs);
    while !done() {
        assert!(Instant::now() < deadline, "condition never reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn notify_invokes_handler_without_reply() {
    let observed = Arc::new(AtomicI64::new(0));
    let sink = observed.clone();
    let tick = Signature::<(), (i64,)>::new("tick");
    let service = ServiceBuilder::new()
        .route(&tick, move |v: &i64| {
            sink.store(*v, Ordering::SeqCst);
        })
        .unwrap()
        .build();
    let pair = connected_pair(service);

    assert!(tick.notify(&pair.client, &(42,)));
    wait_until(5, || observed.load(Ordering::SeqCst) == 42);

    // no reply was written back toward the client
    std::thread::sleep(Duration::from_millis(50));
    let (_, written_after) = pair.server.totals();
    assert_eq!(written_after, 0);
}

#[test]
fn group_notify_reaches_each_member_once() {
    let exec = WorkerPool::new(4);
    let tick = Signature::<(), (i64,)>::new("tick");

    let mut counters = Vec::new();
    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..2 {
        let counter = Arc::new(AtomicUsize::new(0));
        let sink = counter.clone();
        let service = ServiceBuilder::new()
            .route(&tick, move |v: &i64| {
                assert_eq!(*v, 42);
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
            .build();

        let (client_end, server_end) = pipe();
        servers.push(
            SessionBuilder::new(server_end, MsgpackRpc::new(), exec.clone())
                .service(service)
                .build(),
        );
        clients.push(SessionBuilder::new(client_end, MsgpackRpc::new(), exec.clone()).build());
        counters.push(counter);
    }

    let group = SessionGroup::new();
    for client in &clients {
        assert!(group.add(client));
    }
    assert!(!group.add(&clients[0])); // duplicate
    assert_eq!(group.len(), 2);

    assert_eq!(group.notify(&tick, &(42,)), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.iter().any(|c| c.load(Ordering::SeqCst) != 1) {
        assert!(Instant::now() < deadline, "notify not delivered");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(50));
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn group_prunes_expired_members_and_keeps_totals_monotonic() {
    let exec = WorkerPool::new(2);
    let tick = Signature::<(), (i64,)>::new("tick");

    let (a_client, _a_server) = pipe();
    let (b_client, _b_server) = pipe();
    let a = SessionBuilder::new(a_client, MsgpackRpc::new(), exec.clone()).build();
    let b = SessionBuilder::new(b_client, MsgpackRpc::new(), exec.clone()).build();

    let group = SessionGroup::new();
    group.add(&a);
    group.add(&b);

    tick.notify(&a, &(1,));
    tick.notify(&b, &(1,));
    let (_, written_before) = group.totals();
    assert!(written_before > 0);

    a.close();
    group.gc();
    assert_eq!(group.len(), 1);

    // folding the removed member's counters keeps totals monotonic
    let (_, written_after) = group.totals();
    assert!(written_after >= written_before);

    tick.notify(&b, &(2,));
    let (_, written_final) = group.totals();
    assert!(written_final >= written_after);
}

#[test]
fn notify_filter_skips_filtered_members() {
    let exec = WorkerPool::new(2);
    let tick = Signature::<(), (i64,)>::new("tick");

    let (a_client, _a_server) = pipe();
    let (b_client, _b_server) = pipe();
    let a = SessionBuilder::new(a_client, MsgpackRpc::new(), exec.clone()).build();
    let b = SessionBuilder::new(b_client, MsgpackRpc::new(), exec.clone()).build();

    let group = SessionGroup::new();
    group.add(&a);
    group.add(&b);

    let only_a = a.profile().local_id();
    let notified = group.notify_filter(&tick, |p| p.local_id() == only_a, &(9,));
    assert_eq!(notified, 1);
}

#[test]
fn release_drains_membership_and_keeps_totals() {
    let exec = WorkerPool::new(2);

    let (a_client, _a_server) = pipe();
    let a = SessionBuilder::new(a_client, MsgpackRpc::new(), exec).build();

    let group = SessionGroup::new();
    group.add(&a);

    // untyped notify path
    let value = 7i64;
    let views = [ObjectConstView::new(&value)];
    assert_eq!(group.notify_views("tick", &views), 1);

    let (_, written) = group.totals();
    assert!(written > 0);

    let drained = group.release();
    assert_eq!(drained.len(), 1);
    assert!(group.is_empty());

    // totals stay continuous after the membership was drained
    let (_, written_after) = group.totals();
    assert_eq!(written_after, written);
}

#[test]
fn expired_sessions_refuse_notify() {
    let pair = connected_pair(Service::empty());
    let tick = Signature::<(), (i64,)>::new("tick");

    assert!(pair.client.close());
    assert!(!tick.notify(&pair.client, &(1,)));
}
