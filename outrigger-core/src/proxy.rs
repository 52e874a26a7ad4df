//! Short-lived arbiter between a protocol adapter and session-owned state.
//!
//! The session builds one [`MessageProxy`] per inbound message and hands it
//! to [`ProtocolAdapter::handle_single_message`](crate::protocol::ProtocolAdapter::handle_single_message).
//! The adapter uses the four narrow methods below; afterwards the session
//! reads the proxy's state tag to decide what to dispatch.

use crate::archive::{dump_json, ArchiveRead};
use crate::error::ArchiveError;
use crate::service::{HandlerPackage, ParamPack, Service};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyState {
    None,
    InProgress,
    Request,
    Notify,
    ReplyOkay,
    ReplyError,
    ReplyExpired,
}

pub struct MessageProxy<'s> {
    session: &'s Session,
    service: &'s Service,
    pub(crate) state: ProxyState,
    pub(crate) msgid: i32,
    package: Option<HandlerPackage>,
}

impl<'s> MessageProxy<'s> {
    pub(crate) fn new(session: &'s Session, service: &'s Service) -> Self {
        Self {
            session,
            service,
            state: ProxyState::None,
            msgid: 0,
            package: None,
        }
    }

    pub(crate) fn take_package(&mut self) -> Option<HandlerPackage> {
        self.package.take()
    }

    /// Check out the parameter buffer for an inbound request. `None` means
    /// the method is unknown.
    pub fn request_parameters(
        &mut self,
        method: &str,
        msgid: i32,
    ) -> Option<&mut dyn ParamPack> {
        debug_assert_eq!(self.state, ProxyState::None);
        self.state = ProxyState::InProgress;

        let package = self.service.checkout(method)?;
        self.package = Some(package);
        self.state = ProxyState::Request;
        self.msgid = msgid;
        self.package.as_mut().map(HandlerPackage::params_mut)
    }

    /// Check out the parameter buffer for an inbound notify.
    pub fn notify_parameters(&mut self, method: &str) -> Option<&mut dyn ParamPack> {
        debug_assert_eq!(self.state, ProxyState::None);
        self.state = ProxyState::InProgress;

        let package = self.service.checkout(method)?;
        self.package = Some(package);
        self.state = ProxyState::Notify;
        self.package.as_mut().map(HandlerPackage::params_mut)
    }

    /// Deserialize a successful reply directly into the pending request's
    /// result buffer. Returns `Ok(false)` when no such request is pending;
    /// the value is consumed and discarded in that case.
    pub fn reply_result(
        &mut self,
        msgid: i32,
        reader: &mut dyn ArchiveRead,
    ) -> Result<bool, ArchiveError> {
        debug_assert_eq!(self.state, ProxyState::None);
        self.state = ProxyState::ReplyExpired;
        self.msgid = msgid;

        let Some(context) = self.session.request_context() else {
            reader.skip_next()?;
            return Ok(false);
        };

        let mut table = context.lock.lock();
        let Some(slot) = table.slots.get_mut(&msgid) else {
            drop(table);
            reader.skip_next()?;
            return Ok(false);
        };

        match slot.result.as_mut() {
            // void-return request: discard the result value
            None => reader.skip_next()?,
            Some(buffer) => buffer.view_mut().restore_from(reader)?,
        }
        drop(table);

        self.state = ProxyState::ReplyOkay;
        Ok(true)
    }

    /// Capture an error reply as JSON-style text in the pending request's
    /// error buffer. Returns `Ok(false)` when no such request is pending.
    pub fn reply_error(
        &mut self,
        msgid: i32,
        reader: &mut dyn ArchiveRead,
    ) -> Result<bool, ArchiveError> {
        debug_assert_eq!(self.state, ProxyState::None);
        self.state = ProxyState::ReplyExpired;
        self.msgid = msgid;

        let Some(context) = self.session.request_context() else {
            reader.skip_next()?;
            return Ok(false);
        };

        let mut table = context.lock.lock();
        let Some(slot) = table.slots.get_mut(&msgid) else {
            drop(table);
            reader.skip_next()?;
            return Ok(false);
        };

        // Buffer cleanup happens right before use; the slot may be pooled.
        slot.error.clear();
        dump_json(reader, &mut slot.error)?;
        drop(table);

        self.state = ProxyState::ReplyError;
        Ok(true)
    }
}
