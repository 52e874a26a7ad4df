//! Small freelist pool with move-only handles.
//!
//! Used to amortize allocation of per-handler parameter buffers. A checked
//! out [`PoolHandle`] returns its buffer on drop; buffers keep whatever
//! state the last user left in them, so users must fully overwrite before
//! reading.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

struct PoolInner<T> {
    free: Mutex<Vec<Box<T>>>,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Pool<T> {
    pub fn new(make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                make: Box::new(make),
            }),
        }
    }

    /// Take a buffer from the freelist, constructing one when empty.
    pub fn checkout(&self) -> PoolHandle<T> {
        let value = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new((self.inner.make)()));
        PoolHandle {
            value: Some(value),
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of idle buffers currently parked in the freelist.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Move-only loan of a pooled buffer; checks the buffer back in on drop.
pub struct PoolHandle<T> {
    value: Option<Box<T>>,
    owner: Weak<PoolInner<T>>,
}

impl<T> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pool handle is empty")
    }
}

impl<T> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pool handle is empty")
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            // The pool may already be gone; the buffer just drops then.
            if let Some(owner) = self.owner.upgrade() {
                owner.free.lock().push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_returned_buffers() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new);
        {
            let mut handle = pool.checkout();
            handle.push(1);
        }
        assert_eq!(pool.idle(), 1);

        let handle = pool.checkout();
        assert_eq!(pool.idle(), 0);
        // Reused buffer keeps its previous state.
        assert_eq!(&*handle, &[1]);
    }

    #[test]
    fn handle_outliving_pool_is_benign() {
        let pool: Pool<u32> = Pool::new(|| 0);
        let handle = pool.checkout();
        drop(pool);
        drop(handle);
    }
}
