//! Type-erased object views.
//!
//! A view pairs an interned metadata reference with an opaque data handle;
//! it is the only type-erased value crossing the session/adapter boundary.
//! Borrowed views ([`ObjectConstView`], [`ObjectView`]) never convey
//! ownership; [`SharedObject`] and [`BoxedObject`] do.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::archive::{ArchiveRead, ArchiveWrite};
use crate::error::ArchiveError;
use crate::meta::{type_metadata, Reflect, TypeMetadata};

/// Borrowed immutable `(metadata, data)` pair.
#[derive(Clone, Copy)]
pub struct ObjectConstView<'a> {
    meta: &'static TypeMetadata,
    data: &'a dyn Any,
}

impl<'a> ObjectConstView<'a> {
    #[must_use]
    pub fn new<T: Reflect>(value: &'a T) -> Self {
        Self {
            meta: type_metadata::<T>(),
            data: value,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &'static TypeMetadata {
        self.meta
    }

    pub fn archive_to(&self, writer: &mut dyn ArchiveWrite) -> Result<(), ArchiveError> {
        self.meta.archive(writer, self.data)
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

impl fmt::Debug for ObjectConstView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectConstView<{}>", self.meta.type_name())
    }
}

/// Borrowed mutable `(metadata, data)` pair, the restore target handed to
/// protocol adapters.
pub struct ObjectView<'a> {
    meta: &'static TypeMetadata,
    data: &'a mut dyn Any,
}

impl<'a> ObjectView<'a> {
    #[must_use]
    pub fn new<T: Reflect>(value: &'a mut T) -> Self {
        Self {
            meta: type_metadata::<T>(),
            data: value,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &'static TypeMetadata {
        self.meta
    }

    pub fn restore_from(&mut self, reader: &mut dyn ArchiveRead) -> Result<(), ArchiveError> {
        self.meta.restore(reader, self.data)
    }

    #[must_use]
    pub fn as_const(&self) -> ObjectConstView<'_> {
        ObjectConstView {
            meta: self.meta,
            data: &*self.data,
        }
    }

    #[must_use]
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut()
    }
}

impl fmt::Debug for ObjectView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectView<{}>", self.meta.type_name())
    }
}

/// Shared-ownership erased object, used for handler return values and
/// structured error payloads.
#[derive(Clone)]
pub struct SharedObject {
    meta: &'static TypeMetadata,
    data: Arc<dyn Any + Send + Sync>,
}

impl SharedObject {
    #[must_use]
    pub fn new<T: Reflect + Sync>(value: T) -> Self {
        Self {
            meta: type_metadata::<T>(),
            data: Arc::new(value),
        }
    }

    #[must_use]
    pub fn from_arc<T: Reflect + Sync>(value: Arc<T>) -> Self {
        Self {
            meta: type_metadata::<T>(),
            data: value,
        }
    }

    #[must_use]
    pub fn view(&self) -> ObjectConstView<'_> {
        ObjectConstView {
            meta: self.meta,
            data: &*self.data,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.meta.type_name()
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

impl fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedObject<{}>", self.meta.type_name())
    }
}

/// Uniquely-owned erased object; the request slot's result buffer.
pub struct BoxedObject {
    meta: &'static TypeMetadata,
    data: Box<dyn Any + Send>,
}

impl BoxedObject {
    #[must_use]
    pub fn new<T: Reflect>(value: T) -> Self {
        Self {
            meta: type_metadata::<T>(),
            data: Box::new(value),
        }
    }

    #[must_use]
    pub fn view(&self) -> ObjectConstView<'_> {
        ObjectConstView {
            meta: self.meta,
            data: &*self.data,
        }
    }

    #[must_use]
    pub fn view_mut(&mut self) -> ObjectView<'_> {
        ObjectView {
            meta: self.meta,
            data: &mut *self.data,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.meta.type_name()
    }

    /// Recover the concrete value; returns `self` unchanged on type
    /// mismatch.
    pub fn downcast<T: Any>(self) -> Result<Box<T>, BoxedObject> {
        let meta = self.meta;
        self.data.downcast::<T>().map_err(|data| BoxedObject { meta, data })
    }
}

impl fmt::Debug for BoxedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxedObject<{}>", self.meta.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_pair_metadata_with_data() {
        let value = 42i64;
        let view = ObjectConstView::new(&value);
        assert_eq!(view.downcast_ref::<i64>(), Some(&42));
        assert_eq!(view.meta().extent(), std::mem::size_of::<i64>());
    }

    #[test]
    fn boxed_object_roundtrips_ownership() {
        let boxed = BoxedObject::new(String::from("hi"));
        let back = boxed.downcast::<String>().unwrap();
        assert_eq!(*back, "hi");
    }

    #[test]
    fn boxed_object_downcast_mismatch_preserves_value() {
        let boxed = BoxedObject::new(7u32);
        let boxed = boxed.downcast::<String>().unwrap_err();
        assert_eq!(*boxed.downcast::<u32>().unwrap(), 7);
    }

    #[test]
    fn shared_object_is_cloneable() {
        let shared = SharedObject::new(5i32);
        let clone = shared.clone();
        assert_eq!(clone.downcast_ref::<i32>(), Some(&5));
    }
}
