//! Per-peer RPC state machine.
//!
//! A session multiplexes requests, notifies, and replies over one transport.
//! It tracks outstanding calls in a slot table keyed by msgid, serializes
//! adapter access behind the protocol lock, and drives reception through the
//! event processor's internal lane so receive handling never runs
//! concurrently with itself.
//!
//! Lock nesting is strictly `protocol lock → request lock`; no path takes
//! them in the other order while holding the first.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::RpcError;
use crate::exec::EventProc;
use crate::monitor::{Monitor, NullMonitor};
use crate::profile::SessionProfile;
use crate::protocol::ProtocolAdapter;
use crate::proxy::{MessageProxy, ProxyState};
use crate::service::Service;
use crate::transport::ByteStream;
use crate::view::{BoxedObject, ObjectConstView};

use crate::error::{HandlerError, ProtocolState};

/// Completion callback of one outstanding request. Receives the request's
/// result buffer on success or the failure reason.
pub type Completion = Box<dyn FnOnce(Result<Option<BoxedObject>, RpcError>) + Send>;

pub(crate) struct RequestSlot {
    /// Taken exactly once: by the reply completion, by an abort, or by
    /// session expiration.
    pub(crate) completion: Option<Completion>,
    /// `None` for void-return requests.
    pub(crate) result: Option<BoxedObject>,
    pub(crate) error: String,
}

pub(crate) struct RequestTable {
    idgen: i32,
    pub(crate) slots: HashMap<i32, RequestSlot>,
}

impl RequestTable {
    /// Generated ids are in `1..=i32::MAX`, wrapping from `i32::MAX`
    /// directly to `1`; `0` is never produced.
    fn next_msgid(&mut self) -> i32 {
        loop {
            self.idgen = if self.idgen >= i32::MAX {
                1
            } else {
                self.idgen + 1
            };
            if !self.slots.contains_key(&self.idgen) {
                return self.idgen;
            }
        }
    }
}

pub(crate) struct RequestContext {
    pub(crate) lock: Mutex<RequestTable>,
    pub(crate) cond: Condvar,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            lock: Mutex::new(RequestTable {
                idgen: 0,
                slots: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

/// Reference to one outstanding request: a weak session pointer plus the
/// msgid. Cheap to clone; supports wait and abort.
#[derive(Clone)]
pub struct RequestHandle {
    session: Weak<Session>,
    msgid: i32,
}

impl RequestHandle {
    #[must_use]
    pub fn msgid(&self) -> i32 {
        self.msgid
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.msgid != 0 && self.session.strong_count() > 0
    }

    /// Block until the request completes (reply, abort, or expiration).
    pub fn wait(&self) {
        if let Some(session) = self.session.upgrade() {
            session.wait(self);
        }
    }

    /// Returns `false` when the request is still pending at the deadline.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match self.session.upgrade() {
            Some(session) => session.wait_for(self, timeout),
            None => true,
        }
    }

    /// Abort the request; exactly one of {reply, abort} wins.
    pub fn abort(&self) -> bool {
        match self.session.upgrade() {
            Some(session) => session.abort_request(self),
            None => false,
        }
    }
}

pub struct Session {
    event_proc: Arc<dyn EventProc>,
    monitor: Arc<dyn Monitor>,
    transport: Arc<dyn ByteStream>,
    /// The protocol lock; guards the adapter and, transitively, all stream
    /// access. Held during send and `handle_single_message`, never during
    /// handler execution.
    protocol: Mutex<Box<dyn ProtocolAdapter>>,
    service: Service,
    profile: SessionProfile,
    valid: AtomicBool,
    autoflush: AtomicBool,
    close_once: Once,
    requests: Option<RequestContext>,
    weak_self: Weak<Session>,
}

impl Session {
    pub(crate) fn request_context(&self) -> Option<&RequestContext> {
        self.requests.as_ref()
    }

    #[must_use]
    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        !self.valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_request_enabled(&self) -> bool {
        self.requests.is_some()
    }

    /// Cumulative `(bytes_read, bytes_written)` of the transport.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.profile.totals()
    }

    /// Issue a request from pre-erased parameter views.
    ///
    /// `result` is the slot's result buffer (`None` for void returns); on
    /// success the completion eventually receives it back, filled.
    pub fn async_request_views(
        &self,
        method: &str,
        params: &[ObjectConstView<'_>],
        result: Option<BoxedObject>,
        completion: Completion,
    ) -> Result<RequestHandle, RpcError> {
        let context = self.requests.as_ref().ok_or(RpcError::RequestsDisabled)?;
        if self.expired() {
            return Err(RpcError::InvalidConnection);
        }

        let msgid = {
            let mut table = context.lock.lock();
            let msgid = table.next_msgid();
            table.slots.insert(
                msgid,
                RequestSlot {
                    completion: Some(completion),
                    result,
                    error: String::new(),
                },
            );
            msgid
        };

        let mut proto = self.protocol.lock();
        let sent = !self.expired() && proto.send_request(method, msgid, params);
        if !sent {
            // Remove our slot before expiring so the drain below cannot
            // invoke the caller's completion; the error return covers it.
            drop(context.lock.lock().slots.remove(&msgid));
            if !self.expired() {
                self.expire_locked(&mut **proto);
            }
            return Err(RpcError::InvalidConnection);
        }

        if self.autoflush.load(Ordering::Relaxed) {
            proto.flush();
        }
        self.update_rw_counters();

        Ok(RequestHandle {
            session: self.weak_self.clone(),
            msgid,
        })
    }

    /// Send a notify from pre-erased parameter views. Returns `false` when
    /// the session is expired.
    pub fn notify_views(&self, method: &str, params: &[ObjectConstView<'_>]) -> bool {
        let mut proto = self.protocol.lock();
        if self.expired() {
            return false;
        }
        if !proto.send_notify(method, params) {
            self.expire_locked(&mut **proto);
            return false;
        }
        if self.autoflush.load(Ordering::Relaxed) {
            proto.flush();
        }
        self.update_rw_counters();
        true
    }

    /// Commit buffered protocol writes.
    pub fn flush(&self) {
        let mut proto = self.protocol.lock();
        if !self.expired() {
            proto.flush();
            self.update_rw_counters();
        }
    }

    /// When disabled, requests and notifies stay buffered until an explicit
    /// [`flush`](Self::flush). Enabled by default.
    pub fn autoflush(&self, enabled: bool) {
        self.autoflush.store(enabled, Ordering::Relaxed);
    }

    /// Expire the session, aborting every pending request. Returns `false`
    /// when already expired; double close is benign.
    pub fn close(&self) -> bool {
        self.close_transport_once();
        let mut proto = self.protocol.lock();
        if self.expired() {
            return false;
        }
        self.expire_locked(&mut **proto);
        true
    }

    /// Block until the handle's request slot is gone.
    pub fn wait(&self, handle: &RequestHandle) {
        let Some(context) = &self.requests else { return };
        let mut table = context.lock.lock();
        while table.slots.contains_key(&handle.msgid) {
            context.cond.wait(&mut table);
        }
    }

    /// Returns `false` when the request is still pending after `timeout`.
    pub fn wait_for(&self, handle: &RequestHandle, timeout: Duration) -> bool {
        self.wait_until(handle, Instant::now() + timeout)
    }

    /// Returns `false` when the request is still pending at `deadline`.
    pub fn wait_until(&self, handle: &RequestHandle, deadline: Instant) -> bool {
        let Some(context) = &self.requests else {
            return true;
        };
        let mut table = context.lock.lock();
        while table.slots.contains_key(&handle.msgid) {
            if context.cond.wait_until(&mut table, deadline).timed_out() {
                return !table.slots.contains_key(&handle.msgid);
            }
        }
        true
    }

    /// Abort an outstanding request. The completion is taken atomically, so
    /// a racing reply cannot invoke it a second time. Returns `false` when
    /// the request already completed or is mid-completion.
    pub fn abort_request(&self, handle: &RequestHandle) -> bool {
        let Some(context) = &self.requests else {
            return false;
        };

        let completion = {
            let mut table = context.lock.lock();
            let Some(slot) = table.slots.get_mut(&handle.msgid) else {
                return false;
            };
            let Some(completion) = slot.completion.take() else {
                return false; // reply completion is already running
            };
            table.slots.remove(&handle.msgid);
            completion
        };

        completion(Err(RpcError::Aborted));
        context.cond.notify_all();

        let mut proto = self.protocol.lock();
        if !self.expired() {
            proto.release_key_mapping_on_abort(handle.msgid);
        }
        true
    }

    // ---- receive cycle ----

    fn on_data_ready(&self) {
        let weak = self.weak_self.clone();
        self.event_proc.post_internal_message(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.drive_receive();
            }
        }));
    }

    fn drive_receive(&self) {
        let mut proxy = MessageProxy::new(self, &self.service);

        let state = {
            let mut proto = self.protocol.lock();
            if self.expired() {
                return;
            }
            let state = proto.handle_single_message(&mut proxy);
            self.update_rw_counters();
            state
        };

        match state {
            ProtocolState::Okay => self.dispatch(proxy),
            ProtocolState::Expired => {
                self.expire();
                // do not re-arm the receive cycle
                return;
            }
            warning => {
                tracing::debug!(peer = %self.profile.peer_name(), ?warning, "receive warning");
                self.monitor.on_receive_warning(&self.profile, warning);
            }
        }

        self.transport.start_wait();
    }

    fn dispatch(&self, mut proxy: MessageProxy<'_>) {
        match proxy.state {
            ProxyState::Request => {
                let msgid = proxy.msgid;
                let Some(package) = proxy.take_package() else {
                    debug_assert!(false, "request proxy without handler package");
                    return;
                };
                let weak = self.weak_self.clone();
                self.event_proc.post_handler_callback(Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.run_request_handler(msgid, package);
                    }
                }));
            }
            ProxyState::Notify => {
                let Some(package) = proxy.take_package() else {
                    debug_assert!(false, "notify proxy without handler package");
                    return;
                };
                let weak = self.weak_self.clone();
                self.event_proc.post_handler_callback(Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.run_notify_handler(package);
                    }
                }));
            }
            ProxyState::ReplyOkay | ProxyState::ReplyError => {
                let successful = proxy.state == ProxyState::ReplyOkay;
                let msgid = proxy.msgid;
                let weak = self.weak_self.clone();
                self.event_proc.post_rpc_completion(Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.complete_reply(msgid, successful);
                    }
                }));
            }
            // Reply for an already-removed request: consumed and discarded.
            ProxyState::ReplyExpired => {}
            ProxyState::None | ProxyState::InProgress => {
                debug_assert!(false, "proxy left in invalid state");
            }
        }
    }

    fn run_request_handler(&self, msgid: i32, package: crate::service::HandlerPackage) {
        match package.invoke(&self.profile) {
            Ok(result) => {
                let mut proto = self.protocol.lock();
                if !self.expired() {
                    proto.send_reply_result(msgid, result.as_ref().map(|r| r.view()));
                }
            }
            Err(error) => {
                self.monitor.on_handler_error(&self.profile, &error);
                let mut proto = self.protocol.lock();
                if !self.expired() {
                    match &error {
                        HandlerError::Structured(payload) => {
                            proto.send_reply_error_view(msgid, payload.view());
                        }
                        HandlerError::Message(message) => {
                            proto.send_reply_error_str(msgid, message);
                        }
                    }
                }
            }
        }
        self.update_rw_counters();
    }

    fn run_notify_handler(&self, package: crate::service::HandlerPackage) {
        if let Err(error) = package.invoke(&self.profile) {
            self.monitor.on_handler_error(&self.profile, &error);
        }
    }

    fn complete_reply(&self, msgid: i32, successful: bool) {
        let Some(context) = &self.requests else { return };

        let (completion, outcome) = {
            let mut table = context.lock.lock();
            let Some(slot) = table.slots.get_mut(&msgid) else {
                return; // aborted in the meantime
            };
            let Some(completion) = slot.completion.take() else {
                return;
            };
            let outcome = if successful {
                Ok(slot.result.take())
            } else {
                Err(RpcError::Remote(std::mem::take(&mut slot.error)))
            };
            (completion, outcome)
        };

        completion(outcome);

        // Erase after the completion ran, so wait() returns only once the
        // caller-visible outcome is in place.
        context.lock.lock().slots.remove(&msgid);
        context.cond.notify_all();
    }

    // ---- expiration ----

    fn close_transport_once(&self) {
        self.close_once.call_once(|| self.transport.close());
    }

    fn expire(&self) {
        let mut proto = self.protocol.lock();
        self.expire_locked(&mut **proto);
    }

    /// Transition to Expired. Caller holds the protocol lock.
    fn expire_locked(&self, proto: &mut dyn ProtocolAdapter) {
        self.close_transport_once();
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(peer = %self.profile.peer_name(), "session expired");

        if let Some(context) = &self.requests {
            let drained: Vec<(i32, Completion)> = {
                let mut table = context.lock.lock();
                table
                    .slots
                    .drain()
                    .filter_map(|(msgid, slot)| slot.completion.map(|c| (msgid, c)))
                    .collect()
            };
            for (msgid, completion) in drained {
                proto.release_key_mapping_on_abort(msgid);
                self.event_proc
                    .post_rpc_completion(Box::new(move || completion(Err(RpcError::Aborted))));
            }
            context.cond.notify_all();
        }

        if let Some(session) = self.weak_self.upgrade() {
            self.event_proc.post_internal_message(Box::new(move || {
                session.monitor.on_session_expired(&session.profile);
            }));
        }
    }

    fn update_rw_counters(&self) {
        let (read, written) = self.transport.totals();
        self.profile.set_totals(read, written);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_transport_once();
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }

        // Dropped while still active: abort pending requests and report the
        // expiration synchronously (no Arc remains to post through).
        if let Some(context) = &self.requests {
            let drained: Vec<Completion> = context
                .lock
                .lock()
                .slots
                .drain()
                .filter_map(|(_, slot)| slot.completion)
                .collect();
            for completion in drained {
                self.event_proc
                    .post_rpc_completion(Box::new(move || completion(Err(RpcError::Aborted))));
            }
        }
        self.monitor.on_session_expired(&self.profile);
    }
}

/// Assembles a [`Session`] and performs the `Created → Active` transition.
pub struct SessionBuilder {
    transport: Arc<dyn ByteStream>,
    protocol: Box<dyn ProtocolAdapter>,
    event_proc: Arc<dyn EventProc>,
    service: Service,
    monitor: Arc<dyn Monitor>,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    enable_request: bool,
}

impl SessionBuilder {
    pub fn new(
        transport: Arc<dyn ByteStream>,
        protocol: impl ProtocolAdapter + 'static,
        event_proc: Arc<dyn EventProc>,
    ) -> Self {
        Self {
            transport,
            protocol: Box::new(protocol),
            event_proc,
            service: Service::empty(),
            monitor: Arc::new(NullMonitor),
            user_data: None,
            enable_request: false,
        }
    }

    #[must_use]
    pub fn service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub fn user_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(data);
        self
    }

    /// Allocate the request context; without it the session can only serve
    /// and notify.
    #[must_use]
    pub fn enable_request(mut self) -> Self {
        self.enable_request = true;
        self
    }

    pub fn build(self) -> Arc<Session> {
        let peer_name = self.transport.peer_name().to_owned();
        let SessionBuilder {
            transport,
            protocol,
            event_proc,
            service,
            monitor,
            user_data,
            enable_request,
        } = self;

        let session = Arc::new_cyclic(|weak: &Weak<Session>| Session {
            event_proc,
            monitor,
            transport,
            protocol: Mutex::new(protocol),
            service,
            profile: SessionProfile::new(peer_name, user_data),
            valid: AtomicBool::new(false),
            autoflush: AtomicBool::new(true),
            close_once: Once::new(),
            requests: if enable_request {
                Some(RequestContext::new())
            } else {
                None
            },
            weak_self: weak.clone(),
        });

        // Wire transport → session, bind the adapter, then go Active and
        // arm the initial receive.
        let weak = Arc::downgrade(&session);
        session.transport.bind(Arc::new(move || {
            if let Some(session) = weak.upgrade() {
                session.on_data_ready();
            }
        }));
        session.protocol.lock().init(session.transport.clone());
        session.valid.store(true, Ordering::Release);
        session.monitor.on_session_created(&session.profile);
        tracing::debug!(
            peer = %session.profile.peer_name(),
            id = session.profile.local_id(),
            "session created"
        );
        session.transport.start_wait();
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgid_wraps_past_int_max_to_one() {
        let mut table = RequestTable {
            idgen: i32::MAX - 1,
            slots: HashMap::new(),
        };
        assert_eq!(table.next_msgid(), i32::MAX);
        assert_eq!(table.next_msgid(), 1);
        assert_eq!(table.next_msgid(), 2);
    }

    #[test]
    fn msgid_skips_live_ids() {
        let mut table = RequestTable {
            idgen: 0,
            slots: HashMap::new(),
        };
        table.slots.insert(
            1,
            RequestSlot {
                completion: None,
                result: None,
                error: String::new(),
            },
        );
        assert_eq!(table.next_msgid(), 2);
    }

    #[test]
    fn msgid_is_never_zero() {
        let mut table = RequestTable {
            idgen: i32::MAX,
            slots: HashMap::new(),
        };
        assert_eq!(table.next_msgid(), 1);
    }
}
