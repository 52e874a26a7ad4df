//! Pre-registered descriptors for the standard vocabulary: integers,
//! floats, `bool`, `String`, `()`, optionals, sequences, fixed arrays,
//! dictionaries, binary buffers, tuples, durations, and a tagged-union
//! helper.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

use crate::archive::{ArchiveRead, ArchiveWrite, EntityType};
use crate::error::ArchiveError;
use crate::meta::{
    cast, cast_mut, primitive_metadata, tuple_factory, type_metadata, PrimitiveControl, PropertyDef,
    Reflect, RequirementStatus, TypeMetadata,
};

macro_rules! reflect_signed {
    ($($ty:ty),*) => {$(
        impl Reflect for $ty {
            fn metadata() -> TypeMetadata {
                struct Ctl;
                impl PrimitiveControl for Ctl {
                    fn entity_type(&self) -> EntityType {
                        EntityType::Integer
                    }
                    fn archive(
                        &self,
                        writer: &mut dyn ArchiveWrite,
                        data: &dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        writer.write_i64(i64::from(*cast::<$ty>(data)))
                    }
                    fn restore(
                        &self,
                        reader: &mut dyn ArchiveRead,
                        data: &mut dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        *cast_mut::<$ty>(data) = reader.read_i64()? as $ty;
                        Ok(())
                    }
                }
                primitive_metadata::<$ty>(Ctl)
            }
        }
    )*};
}

macro_rules! reflect_unsigned {
    ($($ty:ty),*) => {$(
        impl Reflect for $ty {
            fn metadata() -> TypeMetadata {
                struct Ctl;
                impl PrimitiveControl for Ctl {
                    fn entity_type(&self) -> EntityType {
                        EntityType::Integer
                    }
                    fn archive(
                        &self,
                        writer: &mut dyn ArchiveWrite,
                        data: &dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        writer.write_u64(u64::from(*cast::<$ty>(data)))
                    }
                    fn restore(
                        &self,
                        reader: &mut dyn ArchiveRead,
                        data: &mut dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        *cast_mut::<$ty>(data) = reader.read_u64()? as $ty;
                        Ok(())
                    }
                }
                primitive_metadata::<$ty>(Ctl)
            }
        }
    )*};
}

reflect_signed!(i8, i16, i32, i64);
reflect_unsigned!(u8, u16, u32, u64);

impl Reflect for f32 {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::FloatingPoint
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                writer.write_f32(*cast::<f32>(data))
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                *cast_mut::<f32>(data) = reader.read_f64()? as f32;
                Ok(())
            }
        }
        primitive_metadata::<f32>(Ctl)
    }
}

impl Reflect for f64 {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::FloatingPoint
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                writer.write_f64(*cast::<f64>(data))
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                *cast_mut::<f64>(data) = reader.read_f64()?;
                Ok(())
            }
        }
        primitive_metadata::<f64>(Ctl)
    }
}

impl Reflect for bool {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::Boolean
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                writer.write_bool(*cast::<bool>(data))
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                *cast_mut::<bool>(data) = reader.read_bool()?;
                Ok(())
            }
        }
        primitive_metadata::<bool>(Ctl)
    }
}

impl Reflect for String {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::String
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                writer.write_str(cast::<String>(data))
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                reader.read_str(cast_mut::<String>(data))
            }
        }
        primitive_metadata::<String>(Ctl)
    }
}

impl Reflect for () {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::Null
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                _data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                writer.write_null()
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                _data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                reader.skip_next()
            }
        }
        primitive_metadata::<()>(Ctl)
    }
}

impl<T: Reflect + Default> Reflect for Option<T> {
    fn metadata() -> TypeMetadata {
        struct Ctl<T>(PhantomData<fn() -> T>);
        impl<T: Reflect + Default> PrimitiveControl for Ctl<T> {
            fn entity_type(&self) -> EntityType {
                type_metadata::<T>().entity_type()
            }
            fn element(&self) -> Option<&'static TypeMetadata> {
                Some(type_metadata::<T>())
            }
            fn status(&self, data: Option<&dyn std::any::Any>) -> RequirementStatus {
                match data {
                    None => RequirementStatus::Optional,
                    Some(data) => {
                        if cast::<Option<T>>(data).is_some() {
                            RequirementStatus::OptionalHasValue
                        } else {
                            RequirementStatus::OptionalEmpty
                        }
                    }
                }
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                match cast::<Option<T>>(data) {
                    Some(value) => type_metadata::<T>().archive(writer, value),
                    None => writer.write_null(),
                }
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let slot = cast_mut::<Option<T>>(data);
                if reader.is_null_next()? {
                    reader.skip_next()?;
                    *slot = None;
                    Ok(())
                } else {
                    let inner = slot.get_or_insert_with(T::default);
                    type_metadata::<T>().restore(reader, inner)
                }
            }
        }
        primitive_metadata::<Option<T>>(Ctl::<T>(PhantomData))
    }
}

impl<T: Reflect + Default> Reflect for Vec<T> {
    fn metadata() -> TypeMetadata {
        struct Ctl<T>(PhantomData<fn() -> T>);
        impl<T: Reflect + Default> PrimitiveControl for Ctl<T> {
            fn entity_type(&self) -> EntityType {
                EntityType::Array
            }
            fn element(&self) -> Option<&'static TypeMetadata> {
                Some(type_metadata::<T>())
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let list = cast::<Vec<T>>(data);
                writer.array_push(list.len())?;
                for item in list {
                    type_metadata::<T>().archive(writer, item)?;
                }
                writer.array_pop()
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let list = cast_mut::<Vec<T>>(data);
                let key = reader.begin_array()?;
                if !reader.config().merge_on_read {
                    list.clear();
                }
                list.reserve(reader.elem_left()?);
                while !reader.should_break(key)? {
                    let mut item = T::default();
                    type_metadata::<T>().restore(reader, &mut item)?;
                    list.push(item);
                }
                reader.end_array(key)
            }
        }
        primitive_metadata::<Vec<T>>(Ctl::<T>(PhantomData))
    }
}

impl<T: Reflect + Default, const N: usize> Reflect for [T; N] {
    fn metadata() -> TypeMetadata {
        struct Ctl<T, const N: usize>(PhantomData<fn() -> T>);
        impl<T: Reflect + Default, const N: usize> PrimitiveControl for Ctl<T, N> {
            fn entity_type(&self) -> EntityType {
                EntityType::Tuple
            }
            fn element(&self) -> Option<&'static TypeMetadata> {
                Some(type_metadata::<T>())
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let array = cast::<[T; N]>(data);
                writer.array_push(N)?;
                for item in array {
                    type_metadata::<T>().archive(writer, item)?;
                }
                writer.array_pop()
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let array = cast_mut::<[T; N]>(data);
                let key = reader.begin_array()?;
                for item in array.iter_mut() {
                    type_metadata::<T>().restore(reader, item)?;
                }
                reader.end_array(key)
            }
        }
        primitive_metadata::<[T; N]>(Ctl::<T, N>(PhantomData))
    }
}

macro_rules! reflect_map {
    ($map:ident, $($bound:path),*) => {
        impl<K, V> Reflect for $map<K, V>
        where
            K: Reflect + Default $(+ $bound)*,
            V: Reflect + Default,
        {
            fn metadata() -> TypeMetadata {
                struct Ctl<K, V>(PhantomData<fn() -> (K, V)>);
                impl<K, V> PrimitiveControl for Ctl<K, V>
                where
                    K: Reflect + Default $(+ $bound)*,
                    V: Reflect + Default,
                {
                    fn entity_type(&self) -> EntityType {
                        EntityType::Dictionary
                    }
                    fn element(&self) -> Option<&'static TypeMetadata> {
                        Some(type_metadata::<V>())
                    }
                    fn archive(
                        &self,
                        writer: &mut dyn ArchiveWrite,
                        data: &dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        let map = cast::<$map<K, V>>(data);
                        writer.object_push(map.len())?;
                        for (key, value) in map {
                            writer.write_key_next()?;
                            type_metadata::<K>().archive(writer, key)?;
                            type_metadata::<V>().archive(writer, value)?;
                        }
                        writer.object_pop()
                    }
                    fn restore(
                        &self,
                        reader: &mut dyn ArchiveRead,
                        data: &mut dyn std::any::Any,
                    ) -> Result<(), ArchiveError> {
                        let map = cast_mut::<$map<K, V>>(data);
                        let scope = reader.begin_object()?;
                        if !reader.config().merge_on_read {
                            map.clear();
                        }
                        while !reader.should_break(scope)? {
                            reader.read_key_next()?;
                            let mut key = K::default();
                            type_metadata::<K>().restore(reader, &mut key)?;
                            let mut value = V::default();
                            type_metadata::<V>().restore(reader, &mut value)?;
                            map.insert(key, value);
                        }
                        reader.end_object(scope)
                    }
                }
                primitive_metadata::<$map<K, V>>(Ctl::<K, V>(PhantomData))
            }
        }
    };
}

reflect_map!(HashMap, Eq, Hash);
reflect_map!(BTreeMap, Ord);

/// Byte buffer archived as msgpack `bin` (a bare `Vec<u8>` would archive as
/// an integer array).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Reflect for Blob {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::Binary
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let blob = cast::<Blob>(data);
                writer.binary_push(blob.0.len())?;
                writer.binary_write_some(&blob.0)?;
                writer.binary_pop()
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let blob = cast_mut::<Blob>(data);
                let total = reader.begin_binary()?;
                blob.0.clear();
                blob.0.resize(total, 0);
                let mut offset = 0;
                while offset < total {
                    let n = reader.binary_read_some(&mut blob.0[offset..])?;
                    if n == 0 {
                        break;
                    }
                    offset += n;
                }
                reader.end_binary()
            }
        }
        primitive_metadata::<Blob>(Ctl)
    }
}

macro_rules! reflect_tuple {
    ($($ty:ident $idx:tt)+) => {
        reflect_tuple_impl!(($($ty,)+); $($ty $idx)+);
    };
}

// `offset_of!` does not support a tuple type spelled out via a nested
// repetition (`$($ty,)+`) inside the same repetition as `$idx`; binding
// the tuple type to a single `$tup` fragment first avoids that limitation.
macro_rules! reflect_tuple_impl {
    ($tup:ty; $($ty:ident $idx:tt)+) => {
        impl<$($ty: Reflect),+> Reflect for $tup {
            fn metadata() -> TypeMetadata {
                tuple_factory::<$tup>()
                    $(.property(PropertyDef {
                        offset: ::core::mem::offset_of!($tup, $idx),
                        ty: type_metadata::<$ty>(),
                        get: std::sync::Arc::new(
                            |parent: &dyn std::any::Any| -> &dyn std::any::Any {
                                &cast::<$tup>(parent).$idx
                            },
                        ),
                        get_mut: std::sync::Arc::new(
                            |parent: &mut dyn std::any::Any| -> &mut dyn std::any::Any {
                                &mut cast_mut::<$tup>(parent).$idx
                            },
                        ),
                    }))+
                    .build()
            }
        }
    };
}

reflect_tuple!(T0 0);
reflect_tuple!(T0 0 T1 1);
reflect_tuple!(T0 0 T1 1 T2 2);
reflect_tuple!(T0 0 T1 1 T2 2 T3 3);

impl Reflect for Duration {
    fn metadata() -> TypeMetadata {
        struct Ctl;
        impl PrimitiveControl for Ctl {
            fn entity_type(&self) -> EntityType {
                EntityType::Tuple
            }
            fn archive(
                &self,
                writer: &mut dyn ArchiveWrite,
                data: &dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let duration = cast::<Duration>(data);
                writer.array_push(2)?;
                writer.write_u64(duration.as_secs())?;
                writer.write_u64(u64::from(duration.subsec_nanos()))?;
                writer.array_pop()
            }
            fn restore(
                &self,
                reader: &mut dyn ArchiveRead,
                data: &mut dyn std::any::Any,
            ) -> Result<(), ArchiveError> {
                let key = reader.begin_array()?;
                let secs = reader.read_u64()?;
                let nanos = reader.read_u64()? as u32;
                *cast_mut::<Duration>(data) = Duration::new(secs, nanos);
                reader.end_array(key)
            }
        }
        primitive_metadata::<Duration>(Ctl)
    }
}

/// One arm of a tagged union archived as `[index, value]`.
pub struct VariantArm<T> {
    pub archive: fn(&T, &mut dyn ArchiveWrite) -> Result<(), ArchiveError>,
    pub restore: fn(&mut dyn ArchiveRead) -> Result<T, ArchiveError>,
}

/// Descriptor for a user enum archived as `[discriminant, value]`.
///
/// `discriminant` maps an instance to its arm index; `arms` must cover every
/// discriminant value.
#[must_use]
pub fn variant_metadata<T: std::any::Any + Send>(
    discriminant: fn(&T) -> usize,
    arms: Vec<VariantArm<T>>,
) -> TypeMetadata {
    struct Ctl<T> {
        discriminant: fn(&T) -> usize,
        arms: Vec<VariantArm<T>>,
    }
    impl<T: std::any::Any + Send> PrimitiveControl for Ctl<T> {
        fn entity_type(&self) -> EntityType {
            EntityType::Tuple
        }
        fn archive(
            &self,
            writer: &mut dyn ArchiveWrite,
            data: &dyn std::any::Any,
        ) -> Result<(), ArchiveError> {
            let value = cast::<T>(data);
            let index = (self.discriminant)(value);
            let arm = self
                .arms
                .get(index)
                .ok_or(ArchiveError::CheckFailed("variant discriminant out of range"))?;
            writer.array_push(2)?;
            writer.write_u64(index as u64)?;
            (arm.archive)(value, writer)?;
            writer.array_pop()
        }
        fn restore(
            &self,
            reader: &mut dyn ArchiveRead,
            data: &mut dyn std::any::Any,
        ) -> Result<(), ArchiveError> {
            let key = reader.begin_array()?;
            let index = reader.read_u64()? as usize;
            let Some(arm) = self.arms.get(index) else {
                reader.end_array(key)?;
                return Err(ArchiveError::Recoverable(format!(
                    "variant index {index} out of range"
                )));
            };
            *cast_mut::<T>(data) = (arm.restore)(reader)?;
            reader.end_array(key)
        }
    }
    primitive_metadata::<T>(Ctl {
        discriminant,
        arms,
    })
}
