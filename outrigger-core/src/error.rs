//! Error taxonomy shared by the archive, protocol, and session layers.

use std::io;

use thiserror::Error;

use crate::view::SharedObject;

/// Transport-level failure surfaced by [`ByteStream`](crate::transport::ByteStream)
/// implementations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream was closed and the receive buffer is drained.
    #[error("stream closed")]
    Closed,

    /// Unrecoverable I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures raised by archive readers and writers.
///
/// `Stream` and `UnexpectedEof` are fatal at the archive layer; everything
/// else is recoverable and left for the protocol adapter to translate into a
/// session disposition.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("type mismatch: expected {expected}, found typecode {found:#04x}")]
    TypeMismatch { expected: &'static str, found: u8 },

    #[error("check failed: {0}")]
    CheckFailed(&'static str),

    #[error("invalid context: {0}")]
    InvalidContext(&'static str),

    #[error("recoverable parse failure: {0}")]
    Recoverable(String),

    /// An object key that no registered property matches.
    #[error("unknown key: {0}")]
    UnknownEntity(String),

    /// Required object properties absent from the wire.
    #[error("{missing} of {required} required properties missing")]
    MissingEntity { missing: usize, required: usize },
}

impl ArchiveError {
    /// Whether this failure leaves the underlying stream unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Stream(_) | Self::UnexpectedEof)
    }
}

/// Outcome of decoding one top-level message frame.
///
/// Warnings never terminate the session; `Expired` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Okay,

    /// The protocol stream is in an irreversible state. The owning session
    /// must be disposed.
    Expired,

    WarningInvalidFormat,
    WarningUnknownMethod,
    WarningInvalidParameterCount,
    WarningInvalidParameterType,
    WarningExpiredReply,
    WarningUnknown,
}

impl ProtocolState {
    #[must_use]
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::Okay | Self::Expired)
    }
}

/// Request-lifecycle errors observed by RPC callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("request aborted")]
    Aborted,

    #[error("request timed out")]
    Timeout,

    #[error("connection expired")]
    InvalidConnection,

    #[error("requests are not enabled on this session")]
    RequestsDisabled,

    /// The peer replied with an error payload. The string carries a
    /// JSON-style dump of the error slot.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Failure reported by a service handler.
///
/// A structured payload is forwarded verbatim as the REPLY error object; a
/// plain message travels as an error string.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("structured handler error ({})", .0.type_name())]
    Structured(SharedObject),

    #[error("{0}")]
    Message(String),
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Message(message.to_owned())
    }
}

impl From<SharedObject> for HandlerError {
    fn from(payload: SharedObject) -> Self {
        Self::Structured(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ArchiveError::UnexpectedEof.is_fatal());
        assert!(ArchiveError::Stream(StreamError::Closed).is_fatal());
        assert!(!ArchiveError::CheckFailed("x").is_fatal());
        assert!(!ArchiveError::ParseFailed("y".into()).is_fatal());
    }

    #[test]
    fn warning_classification() {
        assert!(ProtocolState::WarningUnknownMethod.is_warning());
        assert!(!ProtocolState::Okay.is_warning());
        assert!(!ProtocolState::Expired.is_warning());
    }
}
