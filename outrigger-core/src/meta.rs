//! Per-type metadata registry and the object/tuple archive drivers.
//!
//! Every archivable type owns exactly one immutable [`TypeMetadata`]
//! descriptor, interned on first access and alive for the rest of the
//! process. Descriptors come in three shapes: a *primitive* wraps a
//! [`PrimitiveControl`] vtable, a *tuple* is an ordered property list
//! archived as a fixed-length array, and an *object* adds per-property names
//! and integer keys and archives as a map.

use std::any::{type_name, Any, TypeId};
use std::mem;
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::archive::{ArchiveRead, ArchiveWrite, EntityType};
use crate::error::ArchiveError;

/// Types that can be archived and restored through their registered
/// metadata.
pub trait Reflect: Any + Send {
    /// Build this type's descriptor. Invoked at most once per process, via
    /// [`type_metadata`]; user code never calls it directly.
    fn metadata() -> TypeMetadata
    where
        Self: Sized;
}

static REGISTRY: Lazy<DashMap<TypeId, &'static TypeMetadata>> = Lazy::new(DashMap::new);

/// Interned descriptor for `T`, built on first access.
pub fn type_metadata<T: Reflect>() -> &'static TypeMetadata {
    let id = TypeId::of::<T>();
    if let Some(found) = REGISTRY.get(&id) {
        return *found;
    }

    // Build outside the map lock: descriptor construction recurses into
    // field types, which would otherwise re-enter the same shard.
    let built: &'static TypeMetadata = Box::leak(Box::new(T::metadata()));
    *REGISTRY.entry(id).or_insert(built)
}

/// Requirement state of a value, queried before archiving.
///
/// With no data pointer the answer is absolute (`Required`/`Optional`); with
/// one it reflects the current instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementStatus {
    Required,
    Optional,
    OptionalEmpty,
    OptionalHasValue,
}

impl RequirementStatus {
    #[must_use]
    pub fn is_optional(&self) -> bool {
        !matches!(self, Self::Required)
    }
}

/// Vtable backing a primitive descriptor.
pub trait PrimitiveControl: Send + Sync {
    /// SAX-level kind this primitive archives as.
    fn entity_type(&self) -> EntityType;

    fn archive(&self, writer: &mut dyn ArchiveWrite, data: &dyn Any) -> Result<(), ArchiveError>;

    fn restore(&self, reader: &mut dyn ArchiveRead, data: &mut dyn Any)
        -> Result<(), ArchiveError>;

    fn status(&self, _data: Option<&dyn Any>) -> RequirementStatus {
        RequirementStatus::Required
    }

    /// Element descriptor when this primitive is container-like.
    fn element(&self) -> Option<&'static TypeMetadata> {
        None
    }
}

type Getter = Arc<dyn for<'a> Fn(&'a dyn Any) -> &'a (dyn Any) + Send + Sync>;
type GetterMut = Arc<dyn for<'a> Fn(&'a mut dyn Any) -> &'a mut (dyn Any) + Send + Sync>;

/// Raw property registration produced by [`refl_field!`](crate::refl_field).
pub struct PropertyDef {
    pub offset: usize,
    pub ty: &'static TypeMetadata,
    pub get: Getter,
    pub get_mut: GetterMut,
}

/// One archived property of an object or tuple.
pub struct Property {
    name: String,
    key: i32,
    offset: usize,
    ty: &'static TypeMetadata,
    get: Getter,
    get_mut: GetterMut,
}

impl Property {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Integer key; assigned by the factory when not given explicitly.
    #[must_use]
    pub fn key(&self) -> i32 {
        self.key
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn ty(&self) -> &'static TypeMetadata {
        self.ty
    }

    fn status_of(&self, parent: &dyn Any) -> RequirementStatus {
        self.ty.requirement_status(Some((self.get)(parent)))
    }
}

struct ObjectMeta {
    props: Vec<Property>,
    by_name: HashMap<String, usize>,
    by_key: HashMap<i32, usize>,
    /// Property indices sorted by ascending integer key.
    key_order: Vec<usize>,
    num_required: usize,
}

struct TupleMeta {
    props: Vec<Property>,
}

enum MetaKind {
    Primitive(Box<dyn PrimitiveControl>),
    Tuple(TupleMeta),
    Object(ObjectMeta),
}

/// Immutable per-type descriptor. Constructed exactly once and never
/// destroyed.
pub struct TypeMetadata {
    extent: usize,
    type_id: TypeId,
    type_name: &'static str,
    kind: MetaKind,
}

impl TypeMetadata {
    #[must_use]
    pub fn extent(&self) -> usize {
        self.extent
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, MetaKind::Primitive(_))
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self.kind, MetaKind::Object(_))
    }

    #[must_use]
    pub fn is_tuple(&self) -> bool {
        matches!(self.kind, MetaKind::Tuple(_))
    }

    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match &self.kind {
            MetaKind::Primitive(control) => control.entity_type(),
            MetaKind::Tuple(_) => EntityType::Tuple,
            MetaKind::Object(_) => EntityType::Object,
        }
    }

    #[must_use]
    pub fn requirement_status(&self, data: Option<&dyn Any>) -> RequirementStatus {
        match &self.kind {
            MetaKind::Primitive(control) => control.status(data),
            _ => RequirementStatus::Required,
        }
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.requirement_status(None).is_optional()
    }

    #[must_use]
    pub fn properties(&self) -> &[Property] {
        match &self.kind {
            MetaKind::Primitive(_) => &[],
            MetaKind::Tuple(tuple) => &tuple.props,
            MetaKind::Object(object) => &object.props,
        }
    }

    #[must_use]
    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        match &self.kind {
            MetaKind::Object(object) => object.by_name.get(name).map(|&i| &object.props[i]),
            _ => None,
        }
    }

    /// Archive `data` (which must be an instance of this descriptor's type).
    pub fn archive(
        &self,
        writer: &mut dyn ArchiveWrite,
        data: &dyn Any,
    ) -> Result<(), ArchiveError> {
        match &self.kind {
            MetaKind::Primitive(control) => control.archive(writer, data),
            MetaKind::Object(object) => self.archive_object(object, writer, data),
            MetaKind::Tuple(tuple) => {
                writer.array_push(tuple.props.len())?;
                for prop in &tuple.props {
                    let child = (prop.get)(data);
                    if prop.status_of(data) == RequirementStatus::OptionalEmpty {
                        // empty optional element archives as null in place
                        writer.write_null()?;
                    } else {
                        prop.ty.archive(writer, child)?;
                    }
                }
                writer.array_pop()
            }
        }
    }

    fn archive_object(
        &self,
        object: &ObjectMeta,
        writer: &mut dyn ArchiveWrite,
        data: &dyn Any,
    ) -> Result<(), ArchiveError> {
        let use_integer_key = writer.config().use_integer_key;

        let filled = object
            .props
            .iter()
            .filter(|p| p.status_of(data) != RequirementStatus::OptionalEmpty)
            .count();
        writer.object_push(filled)?;

        let write_one = |writer: &mut dyn ArchiveWrite, prop: &Property| -> Result<(), ArchiveError> {
            if prop.status_of(data) == RequirementStatus::OptionalEmpty {
                return Ok(());
            }
            writer.write_key_next()?;
            if use_integer_key {
                writer.write_u64(prop.key as u64)?;
            } else {
                writer.write_str(&prop.name)?;
            }
            prop.ty.archive(writer, (prop.get)(data))
        };

        if use_integer_key {
            for &index in &object.key_order {
                write_one(&mut *writer, &object.props[index])?;
            }
        } else {
            for prop in &object.props {
                write_one(&mut *writer, prop)?;
            }
        }

        writer.object_pop()
    }

    /// Restore into `data` from the reader's next element.
    pub fn restore(
        &self,
        reader: &mut dyn ArchiveRead,
        data: &mut dyn Any,
    ) -> Result<(), ArchiveError> {
        match &self.kind {
            MetaKind::Primitive(control) => control.restore(reader, data),
            MetaKind::Object(object) => self.restore_object(object, reader, data),
            MetaKind::Tuple(tuple) => {
                let key = reader.begin_array()?;
                for prop in &tuple.props {
                    if prop.ty.is_optional() && reader.is_null_next()? {
                        reader.skip_next()?;
                        continue;
                    }
                    prop.ty.restore(reader, (prop.get_mut)(data))?;
                }
                if !reader.config().allow_unknown_argument && reader.elem_left()? > 0 {
                    reader.end_array(key)?;
                    return Err(ArchiveError::Recoverable("too many tuple elements".into()));
                }
                reader.end_array(key)
            }
        }
    }

    fn restore_object(
        &self,
        object: &ObjectMeta,
        reader: &mut dyn ArchiveRead,
        data: &mut dyn Any,
    ) -> Result<(), ArchiveError> {
        let key = reader.begin_object()?;
        let use_integer_key = reader.config().use_integer_key;
        let allow_missing = reader.config().allow_missing_argument;
        let allow_unknown = reader.config().allow_unknown_argument;

        let mut keybuf = String::new();
        let mut required_seen = 0usize;

        while !reader.should_break(key)? {
            reader.read_key_next()?;

            let index = if use_integer_key {
                let raw = reader.read_u64()?;
                let found = i32::try_from(raw)
                    .ok()
                    .and_then(|k| object.by_key.get(&k).copied());
                if found.is_none() {
                    keybuf = raw.to_string();
                }
                found
            } else {
                keybuf.clear();
                reader.read_str(&mut keybuf)?;
                object.by_name.get(keybuf.as_str()).copied()
            };

            let Some(index) = index else {
                reader.skip_next()?;
                if allow_unknown {
                    continue;
                }
                reader.end_object(key)?;
                return Err(ArchiveError::UnknownEntity(mem::take(&mut keybuf)));
            };

            let prop = &object.props[index];
            if !allow_missing && !prop.ty.is_optional() {
                required_seen += 1;
            }
            prop.ty.restore(reader, (prop.get_mut)(data))?;
        }

        reader.end_object(key)?;

        if !allow_missing && required_seen < object.num_required {
            return Err(ArchiveError::MissingEntity {
                missing: object.num_required - required_seen,
                required: object.num_required,
            });
        }
        Ok(())
    }
}

/// Descriptor for a leaf type backed by `control`.
#[must_use]
pub fn primitive_metadata<T: Any>(control: impl PrimitiveControl + 'static) -> TypeMetadata {
    TypeMetadata {
        extent: mem::size_of::<T>(),
        type_id: TypeId::of::<T>(),
        type_name: type_name::<T>(),
        kind: MetaKind::Primitive(Box::new(control)),
    }
}

struct PendingProp {
    name: String,
    key: i32,
    def: PropertyDef,
}

/// Builder for object descriptors (archived as maps).
///
/// # Panics
///
/// `build` panics on registration errors: duplicate property names,
/// duplicate or non-positive explicit integer keys, duplicate offsets, or a
/// property extending past the owning type. These are programmer errors at
/// type-definition time.
pub struct ObjectFactory<T> {
    props: Vec<PendingProp>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

/// Start building an object descriptor for `T`.
#[must_use]
pub fn object_factory<T: Any>() -> ObjectFactory<T> {
    ObjectFactory {
        props: Vec::new(),
        _marker: std::marker::PhantomData,
    }
}

impl<T: Any> ObjectFactory<T> {
    pub fn property(mut self, def: PropertyDef, name: impl Into<String>) -> Self {
        self.props.push(PendingProp {
            name: name.into(),
            key: -1,
            def,
        });
        self
    }

    /// Register a property with an explicit integer key (must be positive).
    pub fn property_with_key(mut self, def: PropertyDef, name: impl Into<String>, key: i32) -> Self {
        self.props.push(PendingProp {
            name: name.into(),
            key,
            def,
        });
        self
    }

    /// Splice an embedded object field's properties into this descriptor at
    /// the field's offset, composing accessors. The embedded field must
    /// itself be object-typed.
    pub fn flatten(mut self, def: PropertyDef) -> Self {
        let MetaKind::Object(base) = &def.ty.kind else {
            panic!("flatten requires an object-typed field");
        };
        for prop in &base.props {
            let outer = def.get.clone();
            let inner = prop.get.clone();
            let outer_mut = def.get_mut.clone();
            let inner_mut = prop.get_mut.clone();
            self.props.push(PendingProp {
                name: prop.name.clone(),
                key: prop.key,
                def: PropertyDef {
                    offset: def.offset + prop.offset,
                    ty: prop.ty,
                    get: Arc::new(move |data: &dyn Any| -> &dyn Any { inner(outer(data)) }),
                    get_mut: Arc::new(move |data: &mut dyn Any| -> &mut dyn Any {
                        inner_mut(outer_mut(data))
                    }),
                },
            });
        }
        self
    }

    #[must_use]
    pub fn build(self) -> TypeMetadata {
        let extent = mem::size_of::<T>();
        let props = finish_properties(extent, self.props, true);

        let mut by_name = HashMap::with_capacity(props.len());
        let mut by_key = HashMap::with_capacity(props.len());
        for (index, prop) in props.iter().enumerate() {
            assert!(
                by_name.insert(prop.name.clone(), index).is_none(),
                "property name must be unique: {}",
                prop.name
            );
            assert!(
                by_key.insert(prop.key, index).is_none(),
                "integer key must be unique: {}",
                prop.key
            );
        }

        let mut key_order: Vec<usize> = (0..props.len()).collect();
        key_order.sort_by_key(|&i| props[i].key);

        let num_required = props.iter().filter(|p| !p.ty.is_optional()).count();

        TypeMetadata {
            extent,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            kind: MetaKind::Object(ObjectMeta {
                props,
                by_name,
                by_key,
                key_order,
                num_required,
            }),
        }
    }
}

/// Builder for tuple descriptors (archived as fixed-length arrays).
pub struct TupleFactory<T> {
    props: Vec<PendingProp>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

/// Start building a tuple descriptor for `T`.
#[must_use]
pub fn tuple_factory<T: Any>() -> TupleFactory<T> {
    TupleFactory {
        props: Vec::new(),
        _marker: std::marker::PhantomData,
    }
}

impl<T: Any> TupleFactory<T> {
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.props.push(PendingProp {
            name: String::new(),
            key: -1,
            def,
        });
        self
    }

    #[must_use]
    pub fn build(self) -> TypeMetadata {
        let extent = mem::size_of::<T>();
        let props = finish_properties(extent, self.props, false);
        TypeMetadata {
            extent,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            kind: MetaKind::Tuple(TupleMeta { props }),
        }
    }
}

/// Shared factory epilogue: validates offsets against the type's extent,
/// checks offset uniqueness, and (for objects) auto-assigns integer keys to
/// the gaps so every property ends up with one.
fn finish_properties(extent: usize, pending: Vec<PendingProp>, assign_keys: bool) -> Vec<Property> {
    for prop in &pending {
        assert!(
            prop.def.offset + prop.def.ty.extent() <= extent,
            "property '{}' exceeds the owning type's extent",
            prop.name
        );
    }

    let mut offsets: Vec<usize> = pending.iter().map(|p| p.def.offset).collect();
    offsets.sort_unstable();
    assert!(
        offsets.windows(2).all(|w| w[0] != w[1]),
        "property offsets must be unique"
    );

    let mut used_keys: Vec<i32> = Vec::new();
    if assign_keys {
        for prop in &pending {
            if prop.key >= 0 {
                assert!(prop.key > 0, "integer key must be positive");
                used_keys.push(prop.key);
            }
        }
        used_keys.sort_unstable();
        assert!(
            used_keys.windows(2).all(|w| w[0] != w[1]),
            "explicit integer keys must be unique"
        );
    }

    let mut next_key = 1i32;
    let mut used_iter = used_keys.iter().peekable();

    pending
        .into_iter()
        .map(|prop| {
            let key = if !assign_keys {
                prop.key
            } else if prop.key > 0 {
                prop.key
            } else {
                // fill gaps in ascending order, skipping used values
                while let Some(&&used) = used_iter.peek() {
                    if used > next_key {
                        break;
                    }
                    if used == next_key {
                        next_key += 1;
                    }
                    used_iter.next();
                }
                let assigned = next_key;
                next_key += 1;
                assigned
            };
            Property {
                name: prop.name,
                key,
                offset: prop.def.offset,
                ty: prop.def.ty,
                get: prop.def.get,
                get_mut: prop.def.get_mut,
            }
        })
        .collect()
}

/// Archive `value` through its registered metadata.
pub fn archive<T: Reflect>(
    writer: &mut dyn ArchiveWrite,
    value: &T,
) -> Result<(), ArchiveError> {
    type_metadata::<T>().archive(writer, value)
}

/// Restore `into` from the reader's next element.
pub fn restore<T: Reflect>(
    reader: &mut dyn ArchiveRead,
    into: &mut T,
) -> Result<(), ArchiveError> {
    type_metadata::<T>().restore(reader, into)
}

pub(crate) fn cast<T: Any>(data: &dyn Any) -> &T {
    data.downcast_ref::<T>()
        .expect("metadata does not match the viewed data")
}

pub(crate) fn cast_mut<T: Any>(data: &mut dyn Any) -> &mut T {
    data.downcast_mut::<T>()
        .expect("metadata does not match the viewed data")
}

/// Register a field of `$owner` for archival.
///
/// Expands to a [`PropertyDef`] carrying the field offset, the field type's
/// interned metadata, and safe accessor closures.
#[macro_export]
macro_rules! refl_field {
    ($owner:ty, $field:ident) => {{
        fn probe<O, F: $crate::meta::Reflect>(
            _: impl Fn(&O) -> &F,
        ) -> &'static $crate::meta::TypeMetadata {
            $crate::meta::type_metadata::<F>()
        }
        $crate::meta::PropertyDef {
            offset: ::core::mem::offset_of!($owner, $field),
            ty: probe(|owner: &$owner| &owner.$field),
            get: ::std::sync::Arc::new(|parent: &dyn ::core::any::Any| -> &dyn ::core::any::Any {
                &parent
                    .downcast_ref::<$owner>()
                    .expect("metadata does not match the viewed data")
                    .$field
            }),
            get_mut: ::std::sync::Arc::new(
                |parent: &mut dyn ::core::any::Any| -> &mut dyn ::core::any::Any {
                    &mut parent
                        .downcast_mut::<$owner>()
                        .expect("metadata does not match the viewed data")
                        .$field
                },
            ),
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refl_field;

    #[derive(Debug, Default, PartialEq)]
    struct Sample {
        id: u32,
        label: String,
        score: Option<f64>,
    }

    impl Reflect for Sample {
        fn metadata() -> TypeMetadata {
            object_factory::<Sample>()
                .property(refl_field!(Sample, id), "id")
                .property_with_key(refl_field!(Sample, label), "label", 3)
                .property(refl_field!(Sample, score), "score")
                .build()
        }
    }

    #[test]
    fn object_metadata_shape() {
        let meta = type_metadata::<Sample>();
        assert!(meta.is_object());
        assert_eq!(meta.extent(), std::mem::size_of::<Sample>());
        assert_eq!(meta.properties().len(), 3);
        assert_eq!(meta.entity_type(), EntityType::Object);
    }

    #[test]
    fn integer_keys_fill_gaps_around_explicit_ones() {
        let meta = type_metadata::<Sample>();
        let keys: Vec<(String, i32)> = meta
            .properties()
            .iter()
            .map(|p| (p.name().to_owned(), p.key()))
            .collect();
        // "label" pinned to 3; the rest fill 1, 2 in declaration order.
        assert_eq!(
            keys,
            vec![
                ("id".to_owned(), 1),
                ("label".to_owned(), 3),
                ("score".to_owned(), 2),
            ]
        );
    }

    #[test]
    fn metadata_is_interned_once() {
        let a = type_metadata::<Sample>() as *const TypeMetadata;
        let b = type_metadata::<Sample>() as *const TypeMetadata;
        assert_eq!(a, b);
    }

    #[test]
    fn optional_property_status_tracks_instance() {
        let meta = type_metadata::<Sample>();
        let with = Sample {
            score: Some(1.0),
            ..Sample::default()
        };
        let without = Sample::default();
        let prop = meta.property_by_name("score").unwrap();
        assert_eq!(
            prop.ty().requirement_status(Some(&with.score)),
            RequirementStatus::OptionalHasValue
        );
        assert_eq!(
            prop.ty().requirement_status(Some(&without.score)),
            RequirementStatus::OptionalEmpty
        );
        assert!(prop.ty().is_optional());
    }

    #[derive(Debug, Default)]
    struct DupName {
        a: u8,
        b: u8,
    }

    #[test]
    #[should_panic(expected = "property name must be unique")]
    fn duplicate_names_are_rejected() {
        let _ = object_factory::<DupName>()
            .property(refl_field!(DupName, a), "x")
            .property(refl_field!(DupName, b), "x")
            .build();
    }

    #[test]
    #[should_panic(expected = "integer key must be positive")]
    fn zero_integer_key_is_rejected() {
        let _ = object_factory::<DupName>()
            .property_with_key(refl_field!(DupName, a), "a", 0)
            .build();
    }
}
