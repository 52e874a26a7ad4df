//! Protocol adapter contract.
//!
//! A protocol adapter converts between one wire protocol's framing and the
//! session's message proxy. Every method is invoked with the session's
//! protocol lock held, so implementations are free to keep unguarded
//! reader/writer state.

use std::sync::Arc;

use crate::error::ProtocolState;
use crate::proxy::MessageProxy;
use crate::transport::ByteStream;
use crate::view::ObjectConstView;

pub trait ProtocolAdapter: Send {
    /// Rebind the internal reader/writer to the session's byte stream.
    fn init(&mut self, stream: Arc<dyn ByteStream>);

    /// Read exactly one top-level message frame and route it through the
    /// proxy. On any warning the remaining bytes of the current frame are
    /// consumed so the stream stays aligned.
    fn handle_single_message(&mut self, proxy: &mut MessageProxy<'_>) -> ProtocolState;

    fn send_request(&mut self, method: &str, msgid: i32, params: &[ObjectConstView<'_>]) -> bool;

    fn send_notify(&mut self, method: &str, params: &[ObjectConstView<'_>]) -> bool;

    /// `None` represents a void return and encodes as a null result.
    fn send_reply_result(&mut self, msgid: i32, result: Option<ObjectConstView<'_>>) -> bool;

    fn send_reply_error_view(&mut self, msgid: i32, error: ObjectConstView<'_>) -> bool;

    fn send_reply_error_str(&mut self, msgid: i32, message: &str) -> bool;

    fn flush(&mut self) -> bool;

    /// Hook for adapters that maintain a local msgid ↔ remote-id map; called
    /// when a request is aborted. The msgpack-rpc adapter keeps msgids
    /// native and uses the default no-op.
    fn release_key_mapping_on_abort(&mut self, _msgid: i32) -> ProtocolState {
        ProtocolState::Okay
    }
}
