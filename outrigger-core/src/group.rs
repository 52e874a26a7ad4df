//! Multi-session fan-out with lazy GC.
//!
//! Notification snapshots the alive members under a single lock, releases
//! it, and iterates the snapshot; expired members are pruned along the way,
//! folding their cumulative byte counters into group offsets so
//! [`SessionGroup::totals`] stays monotonic across membership changes.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::meta::Reflect;
use crate::profile::SessionProfile;
use crate::service::ParamTuple;
use crate::session::Session;
use crate::signature::Signature;
use crate::view::ObjectConstView;

#[derive(Default)]
struct GroupInner {
    members: HashMap<u64, Arc<Session>>,
    read_offset: u64,
    write_offset: u64,
}

impl GroupInner {
    fn fold_out(&mut self, session: &Session) {
        let (read, written) = session.totals();
        self.read_offset = self.read_offset.wrapping_add(read);
        self.write_offset = self.write_offset.wrapping_add(written);
    }

    fn totals(&self) -> (u64, u64) {
        let mut read = self.read_offset;
        let mut written = self.write_offset;
        for session in self.members.values() {
            let (r, w) = session.totals();
            read = read.wrapping_add(r);
            written = written.wrapping_add(w);
        }
        (read, written)
    }

}

/// A concurrent set of sessions used for notify broadcast.
#[derive(Default)]
pub struct SessionGroup {
    inner: Mutex<GroupInner>,
}

impl SessionGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the session is expired or already a member.
    pub fn add(&self, session: &Arc<Session>) -> bool {
        if session.expired() {
            return false;
        }
        let mut inner = self.inner.lock();
        let id = session.profile().local_id();
        if inner.members.contains_key(&id) {
            return false;
        }
        // Offset the member's starting totals so only bytes transferred
        // while in the group count toward the group's totals.
        let (read, written) = session.totals();
        inner.read_offset = inner.read_offset.wrapping_sub(read);
        inner.write_offset = inner.write_offset.wrapping_sub(written);
        inner.members.insert(id, session.clone());
        true
    }

    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        let id = session.profile().local_id();
        match inner.members.remove(&id) {
            Some(member) => {
                inner.fold_out(&member);
                true
            }
            None => false,
        }
    }

    /// Drop expired members now instead of waiting for the next notify.
    pub fn gc(&self) {
        let mut inner = self.inner.lock();
        let expired: Vec<u64> = inner
            .members
            .iter()
            .filter(|(_, s)| s.expired())
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(member) = inner.members.remove(&id) {
                tracing::trace!(peer = %member.profile().peer_name(), "group gc");
                inner.fold_out(&member);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().members.is_empty()
    }

    /// Group-cumulative `(bytes_read, bytes_written)`, monotonic across
    /// membership changes.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.inner.lock().totals()
    }

    /// Drain the membership, keeping totals continuous.
    pub fn release(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        let (read, written) = inner.totals();
        inner.read_offset = read;
        inner.write_offset = written;
        inner.members.drain().map(|(_, s)| s).collect()
    }

    /// Broadcast a notify to every alive member. Returns the number of
    /// sessions notified.
    pub fn notify<Ret, Args>(&self, signature: &Signature<Ret, Args>, args: &Args) -> usize
    where
        Ret: Reflect + Default,
        Args: ParamTuple,
    {
        self.notify_filter(signature, |_| true, args)
    }

    /// Broadcast to members whose profile passes `predicate`.
    pub fn notify_filter<Ret, Args, P>(
        &self,
        signature: &Signature<Ret, Args>,
        predicate: P,
        args: &Args,
    ) -> usize
    where
        Ret: Reflect + Default,
        Args: ParamTuple,
        P: Fn(&SessionProfile) -> bool,
    {
        let alive = self.snapshot();
        let mut notified = 0;
        for session in &alive {
            if predicate(session.profile()) && signature.notify(session, args) {
                notified += 1;
            }
        }
        notified
    }

    /// Broadcast from pre-erased parameter views.
    pub fn notify_views(&self, method: &str, params: &[ObjectConstView<'_>]) -> usize {
        let alive = self.snapshot();
        let mut notified = 0;
        for session in &alive {
            if session.notify_views(method, params) {
                notified += 1;
            }
        }
        notified
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        let expired: Vec<u64> = inner
            .members
            .iter()
            .filter(|(_, s)| s.expired())
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(member) = inner.members.remove(&id) {
                inner.fold_out(&member);
            }
        }
        inner.members.values().cloned().collect()
    }
}
