//! Shared fixtures for the end-to-end tests.
#![allow(dead_code)] // not every test binary uses every fixture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use outrigger::pipe::pipe;
use outrigger::prelude::*;
use outrigger::worker::WorkerPool;

/// Connected client/server session pair over an in-process pipe.
pub struct Pair {
    pub client: Arc<Session>,
    pub server: Arc<Session>,
    pub exec: Arc<WorkerPool>,
}

pub fn connected_pair(server_service: Service) -> Pair {
    connected_pair_with(server_service, Arc::new(NullMonitor), Arc::new(NullMonitor))
}

/// Opt into log output for debugging failures: `RUST_LOG=debug cargo test`.
pub fn init_test_logging() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn connected_pair_with(
    server_service: Service,
    client_monitor: Arc<dyn Monitor>,
    server_monitor: Arc<dyn Monitor>,
) -> Pair {
    init_test_logging();
    let exec = WorkerPool::new(4);
    let (client_end, server_end) = pipe();

    let server = SessionBuilder::new(server_end, MsgpackRpc::new(), exec.clone())
        .service(server_service)
        .monitor(server_monitor)
        .build();
    let client = SessionBuilder::new(client_end, MsgpackRpc::new(), exec.clone())
        .enable_request()
        .monitor(client_monitor)
        .build();

    Pair {
        client,
        server,
        exec,
    }
}

/// Monitor counting lifecycle events.
#[derive(Default)]
pub struct CountingMonitor {
    pub created: AtomicUsize,
    pub expired: AtomicUsize,
    pub warnings: AtomicUsize,
    pub handler_errors: AtomicUsize,
}

impl Monitor for CountingMonitor {
    fn on_session_created(&self, _profile: &SessionProfile) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_expired(&self, _profile: &SessionProfile) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive_warning(&self, _profile: &SessionProfile, _state: ProtocolState) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
    }

    fn on_handler_error(&self, _profile: &SessionProfile, _error: &HandlerError) {
        self.handler_errors.fetch_add(1, Ordering::SeqCst);
    }
}
