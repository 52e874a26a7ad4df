//! Name → handler routing table.
//!
//! A [`Service`] is immutable after [`ServiceBuilder::build`]. Each handler
//! owns a pool of parameter buffers; checking one out yields a
//! [`HandlerPackage`] that keeps the handler alive past session teardown and
//! exposes the pooled tuple as erased views for the protocol adapter to
//! deserialize into.

use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use smallvec::SmallVec;
use thiserror::Error;

use crate::error::HandlerError;
use crate::meta::Reflect;
use crate::pool::{Pool, PoolHandle};
use crate::profile::SessionProfile;
use crate::view::{ObjectConstView, ObjectView, SharedObject};

/// Erased, pooled parameter buffer of one inbound call.
pub trait ParamPack: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore target for the parameter at `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of range.
    fn view_mut(&mut self, index: usize) -> ObjectView<'_>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Tuple of parameter types usable in signatures and handlers.
pub trait ParamTuple: Default + Send + 'static {
    const ARITY: usize;

    /// Restore target for the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of range.
    fn view_mut(&mut self, index: usize) -> ObjectView<'_>;

    /// Borrowed const views of every element, in order.
    fn const_views(&self) -> SmallVec<[ObjectConstView<'_>; 4]>;
}

macro_rules! impl_param_tuple {
    ($($ty:ident $idx:tt)*) => {
        impl<$($ty: Reflect + Default),*> ParamTuple for ($($ty,)*) {
            const ARITY: usize = 0 $(+ { let _ = $idx; 1 })*;

            fn view_mut(&mut self, index: usize) -> ObjectView<'_> {
                match index {
                    $($idx => ObjectView::new(&mut self.$idx),)*
                    _ => panic!("parameter index out of range"),
                }
            }

            #[allow(unused_mut)]
            fn const_views(&self) -> SmallVec<[ObjectConstView<'_>; 4]> {
                let mut views = SmallVec::new();
                $(views.push(ObjectConstView::new(&self.$idx));)*
                views
            }
        }
    };
}

impl_param_tuple!();
impl_param_tuple!(A0 0);
impl_param_tuple!(A0 0 A1 1);
impl_param_tuple!(A0 0 A1 1 A2 2);
impl_param_tuple!(A0 0 A1 1 A2 2 A3 3);

/// Handler callables come in three shapes, chosen by overload resolution at
/// registration time:
///
/// - full: `Fn(&SessionProfile, &mut Ret, &A…) -> Result<(), HandlerError>`
/// - with return slot: `Fn(&mut Ret, &A…) -> Result<(), HandlerError>`
/// - plain value: `Fn(&A…) -> Ret`
///
/// Fallible handlers use the first two shapes; their `Err` becomes the
/// REPLY error.
pub trait Handler<Ret, Args, Marker>: Send + Sync + 'static {
    fn call(
        &self,
        profile: &SessionProfile,
        ret: &mut Ret,
        args: &Args,
    ) -> Result<(), HandlerError>;
}

pub struct FullShape;
pub struct RetShape;
pub struct ValueShape;

macro_rules! impl_handler_shapes {
    ($($ty:ident $idx:tt)*) => {
        impl<F, Ret, $($ty),*> Handler<Ret, ($($ty,)*), FullShape> for F
        where
            F: Fn(&SessionProfile, &mut Ret, $(&$ty),*) -> Result<(), HandlerError>
                + Send + Sync + 'static,
        {
            fn call(
                &self,
                profile: &SessionProfile,
                ret: &mut Ret,
                args: &($($ty,)*),
            ) -> Result<(), HandlerError> {
                let _ = args;
                (self)(profile, ret, $(&args.$idx),*)
            }
        }

        impl<F, Ret, $($ty),*> Handler<Ret, ($($ty,)*), RetShape> for F
        where
            F: Fn(&mut Ret, $(&$ty),*) -> Result<(), HandlerError> + Send + Sync + 'static,
        {
            fn call(
                &self,
                _profile: &SessionProfile,
                ret: &mut Ret,
                args: &($($ty,)*),
            ) -> Result<(), HandlerError> {
                let _ = args;
                (self)(ret, $(&args.$idx),*)
            }
        }

        impl<F, Ret, $($ty),*> Handler<Ret, ($($ty,)*), ValueShape> for F
        where
            F: Fn($(&$ty),*) -> Ret + Send + Sync + 'static,
        {
            fn call(
                &self,
                _profile: &SessionProfile,
                ret: &mut Ret,
                args: &($($ty,)*),
            ) -> Result<(), HandlerError> {
                let _ = args;
                *ret = (self)($(&args.$idx),*);
                Ok(())
            }
        }

    };
}

impl_handler_shapes!();
impl_handler_shapes!(A0 0);
impl_handler_shapes!(A0 0 A1 1);
impl_handler_shapes!(A0 0 A1 1 A2 2);
impl_handler_shapes!(A0 0 A1 1 A2 2 A3 3);

/// Registered handler of one method.
pub trait ServiceHandler: Send + Sync {
    fn num_params(&self) -> usize;

    /// Loan a parameter buffer from this handler's pool.
    fn checkout_parameters(&self) -> Box<dyn ParamPack>;

    /// Run the handler. A `None` result represents a void return.
    fn invoke(
        &self,
        profile: &SessionProfile,
        params: Box<dyn ParamPack>,
    ) -> Result<Option<SharedObject>, HandlerError>;
}

/// Bundle of a handler and a checked-out parameter buffer. Holding the
/// handler `Arc` keeps it alive past service/session teardown.
pub struct HandlerPackage {
    handler: Arc<dyn ServiceHandler>,
    params: Box<dyn ParamPack>,
}

impl HandlerPackage {
    pub fn params_mut(&mut self) -> &mut dyn ParamPack {
        &mut *self.params
    }

    pub fn invoke(self, profile: &SessionProfile) -> Result<Option<SharedObject>, HandlerError> {
        self.handler.invoke(profile, self.params)
    }
}

struct PooledParams<Args: ParamTuple> {
    handle: PoolHandle<Args>,
}

impl<Args: ParamTuple> ParamPack for PooledParams<Args> {
    fn len(&self) -> usize {
        Args::ARITY
    }

    fn view_mut(&mut self, index: usize) -> ObjectView<'_> {
        (*self.handle).view_mut(index)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

struct HandlerImpl<Ret, Args, F, M> {
    handler: F,
    pool: Pool<Args>,
    _marker: std::marker::PhantomData<fn(Args) -> (Ret, M)>,
}

impl<Ret, Args, F, M> ServiceHandler for HandlerImpl<Ret, Args, F, M>
where
    Ret: Reflect + Default + Sync,
    Args: ParamTuple,
    F: Handler<Ret, Args, M>,
    M: 'static,
{
    fn num_params(&self) -> usize {
        Args::ARITY
    }

    fn checkout_parameters(&self) -> Box<dyn ParamPack> {
        Box::new(PooledParams {
            handle: self.pool.checkout(),
        })
    }

    fn invoke(
        &self,
        profile: &SessionProfile,
        params: Box<dyn ParamPack>,
    ) -> Result<Option<SharedObject>, HandlerError> {
        let pack = params
            .into_any()
            .downcast::<PooledParams<Args>>()
            .expect("parameter pack checked out from another handler");

        let mut ret = Ret::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.call(profile, &mut ret, &*pack.handle)
        }));
        drop(pack);

        match outcome {
            Err(payload) => Err(HandlerError::Message(panic_message(&payload))),
            Ok(Err(error)) => Err(error),
            Ok(Ok(())) => {
                if TypeId::of::<Ret>() == TypeId::of::<()>() {
                    Ok(None)
                } else {
                    Ok(Some(SharedObject::new(ret)))
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_owned()
    }
}

type ServiceTable = HashMap<String, Arc<dyn ServiceHandler>>;

static EMPTY_TABLE: Lazy<Arc<ServiceTable>> = Lazy::new(|| Arc::new(ServiceTable::new()));

/// Immutable method routing table.
#[derive(Clone)]
pub struct Service {
    table: Arc<ServiceTable>,
}

impl Service {
    /// The shared empty service.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            table: EMPTY_TABLE.clone(),
        }
    }

    #[must_use]
    pub fn find(&self, method: &str) -> Option<&Arc<dyn ServiceHandler>> {
        self.table.get(method)
    }

    /// Combine two services; `other` wins on name collisions.
    #[must_use]
    pub fn merge(base: &Service, other: &Service) -> Service {
        let mut table = ServiceTable::with_capacity(base.table.len() + other.table.len());
        for (name, handler) in base.table.iter().chain(other.table.iter()) {
            table.insert(name.clone(), handler.clone());
        }
        Service {
            table: Arc::new(table),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub(crate) fn checkout(&self, method: &str) -> Option<HandlerPackage> {
        let handler = self.find(method)?;
        Some(HandlerPackage {
            handler: handler.clone(),
            params: handler.checkout_parameters(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("method name already routed: {0}")]
    DuplicateMethod(String),
}

/// Accumulates routes, then freezes into a [`Service`].
#[derive(Default)]
pub struct ServiceBuilder {
    table: ServiceTable,
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder").finish_non_exhaustive()
    }
}

impl ServiceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `signature`'s method name to `handler`.
    pub fn route<Ret, Args, M, F>(
        mut self,
        signature: &crate::signature::Signature<Ret, Args>,
        handler: F,
    ) -> Result<Self, ServiceError>
    where
        Ret: Reflect + Default + Sync,
        Args: ParamTuple,
        F: Handler<Ret, Args, M>,
        M: 'static,
    {
        let name = signature.name().to_owned();
        if self.table.contains_key(&name) {
            return Err(ServiceError::DuplicateMethod(name));
        }
        let entry: Arc<dyn ServiceHandler> = Arc::new(HandlerImpl::<Ret, Args, F, M> {
            handler,
            pool: Pool::new(Args::default),
            _marker: std::marker::PhantomData,
        });
        self.table.insert(name, entry);
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Service {
        Service {
            table: Arc::new(self.table),
        }
    }
}
