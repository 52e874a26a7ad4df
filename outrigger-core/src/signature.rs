//! Typed method signatures.
//!
//! A [`Signature`] names a remote method once and carries its return and
//! parameter types; the same value drives client-side calls
//! (`request`/`async_request`/`notify`) and server-side routing
//! ([`ServiceBuilder::route`](crate::service::ServiceBuilder::route)).

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::RpcError;
use crate::meta::Reflect;
use crate::service::ParamTuple;
use crate::session::{Completion, RequestHandle, Session};
use crate::view::BoxedObject;

pub struct Signature<Ret, Args> {
    name: String,
    _marker: PhantomData<fn(Args) -> Ret>,
}

impl<Ret, Args> Clone for Signature<Ret, Args> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Ret, Args> Signature<Ret, Args> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Ret, Args> Signature<Ret, Args>
where
    Ret: Reflect + Default,
    Args: ParamTuple,
{
    /// Fire-and-forget invocation. Returns `false` when the session is
    /// expired.
    pub fn notify(&self, session: &Session, args: &Args) -> bool {
        let views = args.const_views();
        session.notify_views(&self.name, &views)
    }

    /// Issue the request and deliver the typed outcome to `complete` on an
    /// executor thread.
    pub fn async_request<C>(
        &self,
        session: &Session,
        args: &Args,
        complete: C,
    ) -> Result<RequestHandle, RpcError>
    where
        C: FnOnce(Result<Ret, RpcError>) + Send + 'static,
    {
        let views = args.const_views();
        let result = if TypeId::of::<Ret>() == TypeId::of::<()>() {
            // void return: the reply's result slot is discarded
            None
        } else {
            Some(BoxedObject::new(Ret::default()))
        };

        let completion: Completion = Box::new(move |outcome| {
            let mapped = outcome.map(|buffer| match buffer {
                Some(buffer) => *buffer
                    .downcast::<Ret>()
                    .expect("result buffer type mismatch"),
                None => Ret::default(),
            });
            complete(mapped);
        });

        session.async_request_views(&self.name, &views, result, completion)
    }

    /// Blocking invocation; waits until the reply, abort, or expiration.
    pub fn request(&self, session: &Session, args: &Args) -> Result<Ret, RpcError> {
        let cell = Arc::new(Mutex::new(None));
        let slot = cell.clone();
        let handle = self.async_request(session, args, move |outcome| {
            *slot.lock() = Some(outcome);
        })?;

        session.wait(&handle);
        let result = cell.lock().take().unwrap_or(Err(RpcError::Aborted));
        result
    }

    /// Blocking invocation with a caller-side timeout. On timeout the
    /// request is aborted; the peer may still reply later and that reply is
    /// silently discarded.
    pub fn request_for(
        &self,
        session: &Session,
        args: &Args,
        timeout: Duration,
    ) -> Result<Ret, RpcError> {
        let deadline = Instant::now() + timeout;
        let cell = Arc::new(Mutex::new(None));
        let slot = cell.clone();
        let handle = self.async_request(session, args, move |outcome| {
            *slot.lock() = Some(outcome);
        })?;

        if !session.wait_until(&handle, deadline) {
            handle.abort();
            return Err(RpcError::Timeout);
        }
        let result = cell.lock().take().unwrap_or(Err(RpcError::Aborted));
        result
    }
}
