//! In-process pipe transport: a pair of linked byte buffers with condition
//! variables, for same-process peers and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};

use outrigger_core::error::StreamError;
use outrigger_core::transport::{ByteStream, DataReady};

#[derive(Default)]
struct HalfState {
    buf: BytesMut,
    /// Bytes ever enqueued into this half.
    total: u64,
    closed: bool,
    /// The receiving side's arrival callback and its single-shot arm flag.
    waker: Option<DataReady>,
    armed: bool,
}

#[derive(Default)]
struct PipeHalf {
    state: Mutex<HalfState>,
    cond: Condvar,
}

impl PipeHalf {
    /// Mark closed and return the armed waker, if any, to fire outside the
    /// lock.
    fn close(&self) -> Option<DataReady> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        self.cond.notify_all();
        if state.armed {
            state.armed = false;
            state.waker.clone()
        } else {
            None
        }
    }
}

static PIPE_IDS: AtomicU64 = AtomicU64::new(0);

/// One endpoint of an in-process pipe pair.
pub struct PipeTransport {
    name: String,
    rx: Arc<PipeHalf>,
    tx: Arc<PipeHalf>,
}

/// Create a linked pair of pipe endpoints.
pub fn pipe() -> (Arc<PipeTransport>, Arc<PipeTransport>) {
    let id = PIPE_IDS.fetch_add(1, Ordering::Relaxed);
    let a = Arc::new(PipeHalf::default());
    let b = Arc::new(PipeHalf::default());
    (
        Arc::new(PipeTransport {
            name: format!("inproc:{id}a"),
            rx: a.clone(),
            tx: b.clone(),
        }),
        Arc::new(PipeTransport {
            name: format!("inproc:{id}b"),
            rx: b,
            tx: a,
        }),
    )
}

impl ByteStream for PipeTransport {
    fn peer_name(&self) -> &str {
        &self.name
    }

    fn bind(&self, on_data: DataReady) {
        self.rx.state.lock().waker = Some(on_data);
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut state = self.rx.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                buf[..n].copy_from_slice(&state.buf[..n]);
                state.buf.advance(n);
                return Ok(n);
            }
            if state.closed {
                return Err(StreamError::Closed);
            }
            self.rx.cond.wait(&mut state);
        }
    }

    fn write(&self, buf: &[u8]) -> Result<(), StreamError> {
        let waker = {
            let mut state = self.tx.state.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            state.buf.extend_from_slice(buf);
            state.total += buf.len() as u64;
            self.tx.cond.notify_all();
            if state.armed {
                state.armed = false;
                state.waker.clone()
            } else {
                None
            }
        };
        // Fire outside the lock; the callback posts into an event proc.
        if let Some(waker) = waker {
            waker();
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StreamError> {
        Ok(())
    }

    fn start_wait(&self) {
        let waker = {
            let mut state = self.rx.state.lock();
            if !state.buf.is_empty() || state.closed {
                state.waker.clone()
            } else {
                state.armed = true;
                None
            }
        };
        if let Some(waker) = waker {
            waker();
        }
    }

    fn totals(&self) -> (u64, u64) {
        // One half at a time: the peer endpoint locks the same halves in
        // the opposite order.
        let read = self.rx.state.lock().total;
        let written = self.tx.state.lock().total;
        (read, written)
    }

    fn close(&self) {
        for waker in [self.rx.close(), self.tx.close()] {
            if let Some(waker) = waker {
                waker();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn bytes_flow_between_endpoints() {
        let (a, b) = pipe();
        a.write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(a.totals().1, 5);
        assert_eq!(b.totals().0, 5);
    }

    #[test]
    fn armed_wait_fires_on_write() {
        let (a, b) = pipe();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        b.bind(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        b.start_wait();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        a.write(b"x").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // single-shot: a second write does not fire again until re-armed
        a.write(b"y").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // re-arming with pending data fires immediately
        b.start_wait();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_terminates_armed_wait_and_reads() {
        let (a, b) = pipe();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        b.bind(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        b.start_wait();

        a.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let mut buf = [0u8; 4];
        assert!(matches!(b.read(&mut buf), Err(StreamError::Closed)));
        assert!(matches!(a.write(b"z"), Err(StreamError::Closed)));
    }
}
