//! Per-session descriptive profile.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(0);

/// Descriptive state of one session, visible to service handlers and
/// monitors.
pub struct SessionProfile {
    peer_name: String,
    local_id: u64,
    total_read: AtomicU64,
    total_write: AtomicU64,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl SessionProfile {
    pub(crate) fn new(peer_name: String, user_data: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            peer_name,
            local_id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed) + 1,
            total_read: AtomicU64::new(0),
            total_write: AtomicU64::new(0),
            user_data,
        }
    }

    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Process-unique, monotonically assigned id.
    #[must_use]
    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Cumulative `(bytes_read, bytes_written)` of the owning transport.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_read.load(Ordering::Relaxed),
            self.total_write.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    pub fn user_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.user_data.as_ref()
    }

    pub(crate) fn set_totals(&self, read: u64, write: u64) {
        self.total_read.store(read, Ordering::Relaxed);
        self.total_write.store(write, Ordering::Relaxed);
    }
}
