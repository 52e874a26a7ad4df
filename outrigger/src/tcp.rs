//! TCP transport.
//!
//! Blocking reads and writes over a `std::net::TcpStream`; arrival
//! notification is provided by a watcher thread that parks until armed,
//! then issues a blocking one-byte `peek` and fires the session callback.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::{io, thread};

use parking_lot::{Condvar, Mutex};
use socket2::SockRef;

use outrigger_core::error::StreamError;
use outrigger_core::transport::{ByteStream, DataReady};

#[derive(Default)]
struct WatchState {
    armed: Mutex<bool>,
    cond: Condvar,
}

pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    read_total: AtomicU64,
    write_total: AtomicU64,
    waker: Mutex<Option<DataReady>>,
    watch: Arc<WatchState>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connect to `addr` and spawn the readiness watcher.
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Arc<Self>> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    /// Accept one connection from `listener`.
    pub fn accept(listener: &TcpListener) -> io::Result<Arc<Self>> {
        let (stream, _) = listener.accept()?;
        Self::from_stream(stream)
    }

    /// Wrap an established stream. Sets nodelay and keepalive.
    pub fn from_stream(stream: TcpStream) -> io::Result<Arc<Self>> {
        {
            let sock = SockRef::from(&stream);
            sock.set_nodelay(true)?;
            sock.set_keepalive(true)?;
        }
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "tcp:unknown".to_owned(), |addr| format!("tcp:{addr}"));
        tracing::debug!(peer = %peer, "tcp transport ready");

        let transport = Arc::new(Self {
            stream: stream.try_clone()?,
            peer,
            read_total: AtomicU64::new(0),
            write_total: AtomicU64::new(0),
            waker: Mutex::new(None),
            watch: Arc::new(WatchState::default()),
            closed: AtomicBool::new(false),
        });

        let watch = transport.watch.clone();
        let weak = Arc::downgrade(&transport);
        thread::Builder::new()
            .name("outrigger-tcp-watch".into())
            .spawn(move || {
                loop {
                    {
                        let mut armed = watch.armed.lock();
                        while !*armed {
                            watch.cond.wait(&mut armed);
                        }
                        *armed = false;
                    }
                    let Some(transport) = weak.upgrade() else { return };
                    if transport.closed.load(Ordering::Acquire) {
                        return;
                    }
                    // Blocks until at least one byte is readable or EOF.
                    let probe = stream.peek(&mut [0u8; 1]);
                    let waker = transport.waker.lock().clone();
                    drop(transport);
                    if let Some(waker) = waker {
                        waker();
                    }
                    match probe {
                        Ok(0) | Err(_) => return, // peer closed; session reads the EOF
                        Ok(_) => {}
                    }
                }
            })?;

        Ok(transport)
    }
}

impl ByteStream for TcpTransport {
    fn peer_name(&self) -> &str {
        &self.peer
    }

    fn bind(&self, on_data: DataReady) {
        *self.waker.lock() = Some(on_data);
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let n = (&self.stream).read(buf)?;
        if n == 0 {
            return Err(StreamError::Closed);
        }
        self.read_total.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<(), StreamError> {
        (&self.stream).write_all(buf)?;
        self.write_total.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<(), StreamError> {
        (&self.stream).flush()?;
        Ok(())
    }

    fn start_wait(&self) {
        let mut armed = self.watch.armed.lock();
        *armed = true;
        self.watch.cond.notify_one();
    }

    fn totals(&self) -> (u64, u64) {
        (
            self.read_total.load(Ordering::Relaxed),
            self.write_total.load(Ordering::Relaxed),
        )
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblocks both the watcher's peek and any in-flight read.
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.start_wait();
    }
}
