//! msgpack-rpc protocol adapter.
//!
//! Frames three message kinds over the archive layer:
//!
//! - REQUEST `[0, msgid, method, params]`
//! - REPLY   `[1, msgid, error_or_nil, result_or_nil]`
//! - NOTIFY  `[2, method, params]`
//!
//! For REPLY exactly one of error/result is non-nil; the error slot carries
//! either a plain string or a structured object, passed through opaquely.
//! All methods run under the owning session's protocol lock.

use std::sync::Arc;

use outrigger_core::archive::{ArchiveConfig, ArchiveRead, ArchiveWrite};
use outrigger_core::error::{ArchiveError, ProtocolState};
use outrigger_core::protocol::ProtocolAdapter;
use outrigger_core::proxy::MessageProxy;
use outrigger_core::transport::ByteStream;
use outrigger_core::view::ObjectConstView;

use crate::reader::Reader;
use crate::writer::Writer;

/// Error string replied to requests naming an unrouted method.
pub const ERR_METHOD_NOT_FOUND: &str = "ERROR_METHOD_NOT_EXIST";
/// Error string replied to requests with mismatched parameters.
pub const ERR_INVALID_PARAMETER: &str = "ERROR_INVALID_PARAMETER";

const MSG_REQUEST: i64 = 0;
const MSG_REPLY: i64 = 1;
const MSG_NOTIFY: i64 = 2;

pub struct MsgpackRpc {
    writer: Writer,
    reader: Reader,
    /// Reused method-name buffer.
    method: String,
}

impl Default for MsgpackRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgpackRpc {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ArchiveConfig::default(), ArchiveConfig::default())
    }

    #[must_use]
    pub fn with_config(read: ArchiveConfig, write: ArchiveConfig) -> Self {
        Self {
            writer: Writer::new(write),
            reader: Reader::new(read),
            method: String::new(),
        }
    }

    fn read_method(&mut self) -> Result<(), ArchiveError> {
        let mut method = std::mem::take(&mut self.method);
        let result = self.reader.read_str(&mut method);
        self.method = method;
        result
    }

    /// Reply an error string to a malformed or unroutable request.
    fn send_error_reply(&mut self, msgid: i32, message: &str) -> Result<(), ArchiveError> {
        self.writer.array_push(4)?;
        self.writer.write_i64(MSG_REPLY)?;
        self.writer.write_i64(i64::from(msgid))?;
        self.writer.write_str(message)?;
        self.writer.write_null()?;
        self.writer.array_pop()?;
        self.writer.flush()
    }

    fn dispatch_message(
        &mut self,
        proxy: &mut MessageProxy<'_>,
    ) -> Result<ProtocolState, ArchiveError> {
        let kind = self.reader.read_i64()?;
        match kind {
            MSG_REPLY => {
                if self.reader.elem_left()? != 3 {
                    return Ok(ProtocolState::WarningInvalidFormat);
                }
                let msgid = self.reader.read_i64()? as i32;

                let live = if self.reader.is_null_next()? {
                    // nil error slot: a valid result follows
                    self.reader.skip_next()?;
                    proxy.reply_result(msgid, &mut self.reader)?
                } else {
                    let live = proxy.reply_error(msgid, &mut self.reader)?;
                    self.reader.skip_next()?; // discard the nil result slot
                    live
                };

                if live {
                    Ok(ProtocolState::Okay)
                } else {
                    Ok(ProtocolState::WarningExpiredReply)
                }
            }

            MSG_NOTIFY => {
                if self.reader.elem_left()? != 2 {
                    return Ok(ProtocolState::WarningInvalidFormat);
                }
                self.read_method()?;

                let Some(params) = proxy.notify_parameters(&self.method) else {
                    return Ok(ProtocolState::WarningUnknownMethod);
                };

                let scope = self.reader.begin_array()?;
                if self.reader.elem_left()? != params.len() {
                    return Ok(ProtocolState::WarningInvalidParameterCount);
                }
                for index in 0..params.len() {
                    let mut view = params.view_mut(index);
                    match view.restore_from(&mut self.reader) {
                        Ok(()) => {}
                        Err(error) if error.is_fatal() => return Err(error),
                        Err(_) => return Ok(ProtocolState::WarningInvalidParameterType),
                    }
                }
                self.reader.end_array(scope)?;
                Ok(ProtocolState::Okay)
            }

            MSG_REQUEST => {
                if self.reader.elem_left()? != 3 {
                    return Ok(ProtocolState::WarningInvalidFormat);
                }
                let msgid = self.reader.read_i64()? as i32;
                self.read_method()?;

                let Some(params) = proxy.request_parameters(&self.method, msgid) else {
                    self.send_error_reply(msgid, ERR_METHOD_NOT_FOUND)?;
                    return Ok(ProtocolState::WarningUnknownMethod);
                };

                let scope = self.reader.begin_array()?;
                if self.reader.elem_left()? != params.len() {
                    self.send_error_reply(msgid, ERR_INVALID_PARAMETER)?;
                    return Ok(ProtocolState::WarningInvalidParameterCount);
                }
                for index in 0..params.len() {
                    let mut view = params.view_mut(index);
                    match view.restore_from(&mut self.reader) {
                        Ok(()) => {}
                        Err(error) if error.is_fatal() => return Err(error),
                        Err(_) => {
                            self.send_error_reply(msgid, ERR_INVALID_PARAMETER)?;
                            return Ok(ProtocolState::WarningInvalidParameterType);
                        }
                    }
                }
                self.reader.end_array(scope)?;
                Ok(ProtocolState::Okay)
            }

            _ => Ok(ProtocolState::WarningInvalidFormat),
        }
    }

    fn encode_call(
        &mut self,
        kind: i64,
        msgid: Option<i32>,
        method: &str,
        params: &[ObjectConstView<'_>],
    ) -> Result<(), ArchiveError> {
        self.writer.array_push(if msgid.is_some() { 4 } else { 3 })?;
        self.writer.write_i64(kind)?;
        if let Some(msgid) = msgid {
            self.writer.write_i64(i64::from(msgid))?;
        }
        self.writer.write_str(method)?;

        self.writer.array_push(params.len())?;
        for param in params {
            param.archive_to(&mut self.writer)?;
        }
        self.writer.array_pop()?;
        self.writer.array_pop()
    }
}

impl ProtocolAdapter for MsgpackRpc {
    fn init(&mut self, stream: Arc<dyn ByteStream>) {
        self.writer.bind(stream.clone());
        self.reader.bind(stream);
    }

    fn handle_single_message(&mut self, proxy: &mut MessageProxy<'_>) -> ProtocolState {
        // A failure to even open the top-level framing array is fatal.
        let top = match self.reader.begin_array() {
            Ok(key) => key,
            Err(_) => return ProtocolState::Expired,
        };

        match self.dispatch_message(proxy) {
            Ok(state) => {
                // Closing the top scope skips any bytes a warning left
                // behind, keeping the stream aligned.
                if self.reader.end_array(top).is_err() {
                    return ProtocolState::Expired;
                }
                state
            }
            Err(error) if error.is_fatal() => ProtocolState::Expired,
            Err(error) => {
                tracing::debug!(%error, "recoverable decode failure");
                if self.reader.end_array(top).is_err() {
                    return ProtocolState::Expired;
                }
                ProtocolState::WarningUnknown
            }
        }
    }

    fn send_request(&mut self, method: &str, msgid: i32, params: &[ObjectConstView<'_>]) -> bool {
        self.encode_call(MSG_REQUEST, Some(msgid), method, params).is_ok()
    }

    fn send_notify(&mut self, method: &str, params: &[ObjectConstView<'_>]) -> bool {
        self.encode_call(MSG_NOTIFY, None, method, params).is_ok()
    }

    fn send_reply_result(&mut self, msgid: i32, result: Option<ObjectConstView<'_>>) -> bool {
        let encoded = (|| -> Result<(), ArchiveError> {
            self.writer.array_push(4)?;
            self.writer.write_i64(MSG_REPLY)?;
            self.writer.write_i64(i64::from(msgid))?;
            self.writer.write_null()?; // error slot
            match result {
                Some(view) => view.archive_to(&mut self.writer)?,
                None => self.writer.write_null()?,
            }
            self.writer.array_pop()?;
            self.writer.flush()
        })();
        encoded.is_ok()
    }

    fn send_reply_error_view(&mut self, msgid: i32, error: ObjectConstView<'_>) -> bool {
        let encoded = (|| -> Result<(), ArchiveError> {
            self.writer.array_push(4)?;
            self.writer.write_i64(MSG_REPLY)?;
            self.writer.write_i64(i64::from(msgid))?;
            error.archive_to(&mut self.writer)?;
            self.writer.write_null()?; // result slot
            self.writer.array_pop()?;
            self.writer.flush()
        })();
        encoded.is_ok()
    }

    fn send_reply_error_str(&mut self, msgid: i32, message: &str) -> bool {
        self.send_error_reply(msgid, message).is_ok()
    }

    fn flush(&mut self) -> bool {
        ArchiveWrite::flush(&mut self.writer).is_ok()
    }
}
