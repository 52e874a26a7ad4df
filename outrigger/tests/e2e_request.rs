//! End-to-end request/reply over the in-process pipe.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outrigger::prelude::*;
use outrigger_core::meta::{object_factory, Reflect, TypeMetadata};
use outrigger_core::refl_field;

use common::{connected_pair, connected_pair_with, CountingMonitor};

#[test]
fn echo_request_roundtrips() {
    let echo = Signature::<String, (String,)>::new("echo");
    let service = ServiceBuilder::new()
        .route(&echo, |text: &String| text.clone())
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let reply = echo
        .request(&pair.client, &("hello, world!".to_string(),))
        .unwrap();
    assert_eq!(reply, "hello, world!");
}

#[test]
fn unknown_method_yields_remote_error() {
    let nope = Signature::<i32, (i32, i32, i32)>::new("nope");
    let monitor = Arc::new(CountingMonitor::default());
    let pair = connected_pair_with(
        Service::empty(),
        Arc::new(NullMonitor),
        monitor.clone(),
    );

    let error = nope.request(&pair.client, &(1, 2, 3)).unwrap_err();
    let RpcError::Remote(text) = error else {
        panic!("expected a remote error");
    };
    assert!(text.contains("ERROR_METHOD_NOT_EXIST"), "got: {text}");

    // the serving side observes the unknown-method warning shortly after
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while monitor.warnings.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "warning never reported");
        std::thread::yield_now();
    }
    assert_eq!(monitor.warnings.load(Ordering::SeqCst), 1);
}

#[test]
fn structured_handler_error_is_forwarded() {
    #[derive(Debug, Default, Clone, PartialEq)]
    struct Fault {
        code: i32,
        detail: String,
    }

    impl Reflect for Fault {
        fn metadata() -> TypeMetadata {
            object_factory::<Fault>()
                .property(refl_field!(Fault, code), "code")
                .property(refl_field!(Fault, detail), "detail")
                .build()
        }
    }

    let failing = Signature::<i32, (i32,)>::new("failing");
    let service = ServiceBuilder::new()
        .route(
            &failing,
            |_ret: &mut i32, v: &i32| -> Result<(), HandlerError> {
                Err(HandlerError::Structured(SharedObject::new(Fault {
                    code: *v,
                    detail: "rejected".into(),
                })))
            },
        )
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let error = failing.request(&pair.client, &(41,)).unwrap_err();
    let RpcError::Remote(text) = error else {
        panic!("expected a remote error");
    };
    // the structured payload arrives as a JSON-style object dump
    assert!(text.contains("\"code\":41"), "got: {text}");
    assert!(text.contains("\"detail\":\"rejected\""), "got: {text}");
}

#[test]
fn void_return_completes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let observed = counter.clone();
    let fire = Signature::<(), (u32,)>::new("fire");
    let service = ServiceBuilder::new()
        .route(&fire, move |v: &u32| {
            observed.fetch_add(*v as usize, Ordering::SeqCst);
        })
        .unwrap()
        .build();
    let pair = connected_pair(service);

    fire.request(&pair.client, &(5,)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn concurrent_requests_multiplex_on_one_session() {
    let double = Signature::<i64, (i64,)>::new("double");
    let service = ServiceBuilder::new()
        .route(&double, |v: &i64| v * 2)
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let mut handles = Vec::new();
    for value in 0..64i64 {
        let client = pair.client.clone();
        let double = double.clone();
        handles.push(std::thread::spawn(move || {
            let reply = double.request(&client, &(value,)).unwrap();
            assert_eq!(reply, value * 2);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn timeout_aborts_the_request() {
    let slow = Signature::<i32, ()>::new("slow");
    let service = ServiceBuilder::new()
        .route(&slow, || -> i32 {
            std::thread::sleep(Duration::from_secs(30));
            1
        })
        .unwrap()
        .build();
    let pair = connected_pair(service);

    let error = slow
        .request_for(&pair.client, &(), Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(error, RpcError::Timeout);
}

#[test]
fn manual_flush_delivers_buffered_requests() {
    let double = Signature::<i64, (i64,)>::new("double");
    let service = ServiceBuilder::new()
        .route(&double, |v: &i64| v * 2)
        .unwrap()
        .build();
    let pair = connected_pair(service);

    pair.client.autoflush(false);
    let (tx, rx) = flume::unbounded();
    double
        .async_request(&pair.client, &(8,), move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();

    // nothing reaches the peer until the explicit flush
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    pair.client.flush();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(16));
}

#[test]
fn requests_require_enable_request() {
    let ping = Signature::<i32, ()>::new("ping");
    let service = ServiceBuilder::new().route(&ping, || 1).unwrap().build();
    let pair = connected_pair(service.clone());

    // the server session was built without enable_request
    let error = ping.request(&pair.server, &()).unwrap_err();
    assert_eq!(error, RpcError::RequestsDisabled);
}
