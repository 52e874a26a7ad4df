//! Byte-stream transport contract.
//!
//! A session owns exactly one [`ByteStream`]. The stream delivers arrival
//! notifications through a callback installed at session initialization;
//! [`ByteStream::start_wait`] arms a single-shot notification which the
//! session re-arms after consuming one message. The stream itself never
//! re-arms.

use std::sync::Arc;

use crate::error::StreamError;

/// Arrival callback installed by the owning session. Wraps a weak session
/// reference, so firing after session teardown is a no-op.
pub type DataReady = Arc<dyn Fn() + Send + Sync>;

/// Buffered duplex byte stream with an async wait-for-data capability.
pub trait ByteStream: Send + Sync {
    /// Human-readable peer identity recorded in the session profile.
    fn peer_name(&self) -> &str;

    /// Install the arrival callback. Invoked once, during session
    /// initialization, before the first `start_wait`.
    fn bind(&self, on_data: DataReady);

    /// Blocking read of at least one byte. Fails with
    /// [`StreamError::Closed`] once the stream is closed and drained.
    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError>;

    /// Write the whole buffer (may be internally buffered).
    fn write(&self, buf: &[u8]) -> Result<(), StreamError>;

    /// Commit internally buffered writes.
    fn flush(&self) -> Result<(), StreamError>;

    /// Arm a single-shot arrival notification. When data becomes readable or
    /// the peer closes, the installed callback fires exactly once.
    fn start_wait(&self);

    /// Monotonically increasing `(bytes_read, bytes_written)` counters.
    fn totals(&self) -> (u64, u64);

    /// Idempotent close. Any in-flight `start_wait` must terminate, either
    /// by delivering data or by eliciting an error on the next read.
    fn close(&self);
}

/// Fill `buf` completely, mapping early EOF to [`StreamError::Closed`].
pub fn read_exact(stream: &dyn ByteStream, buf: &mut [u8]) -> Result<(), StreamError> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = stream.read(&mut buf[offset..])?;
        if n == 0 {
            return Err(StreamError::Closed);
        }
        offset += n;
    }
    Ok(())
}
