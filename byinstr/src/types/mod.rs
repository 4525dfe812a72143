//! Types module
//!
//! This module contains the canonical representation of types used by the
//! `byinstr` crate. It exposes a small type system built on three layers:
//!
//! - Primary types: integer, floating-point, pointer and vector types (see `primary.rs`).
//! - Aggregate types: arrays and structures (see `aggregate.rs`).
//! - A registry-backed [`AnyType`] wrapper and [`TypeRegistry`] which deduplicates
//!   types and hands out dense [`Typeref`] identifiers.
//!
//! The registry also answers the layout questions the instrumentation pass
//! asks: storage size in bytes, primitive size in bits, and vector shape.
use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use log::{debug, info};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::types::{
    aggregate::{ArrayType, StructType},
    primary::{FType, IType, PrimaryBasicType, PrimaryType, PtrType, VcType, VectorSize},
};
pub mod aggregate;
pub mod primary;

/// A stable reference to a type stored inside a `TypeRegistry`.
///
/// References are allocated densely in insertion order, so a registry built
/// by the same sequence of insertions always yields the same references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Typeref(u32);

impl Typeref {
    /// Raw index of the type inside its registry.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// A sum-type representing any type that can be stored in the registry.
///
/// This includes primary (primitive/vector) types, aggregate types like
/// arrays and structures. [`AnyType`] implements `Hash`/`Eq` so it can be
/// deduplicated by the [`TypeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AnyType {
    /// All types that can be represented as [`PrimaryType`]:
    /// - Integer types (eg., `i8`, `i32`, `i64`, etc.)
    /// - Floating-point types (eg., `fp32`, `fp64`)
    /// - Vector types (eg., `<4 x i32>`, `<8 x fp16>`, etc.)
    /// - Pointer types (opaque)
    Primary(PrimaryType),

    /// An array type: element typeref + element count.
    ///
    /// Notice that the number of elements MUST be known at compile time.
    Array(ArrayType),

    /// A structure type: an ordered list of element typerefs.
    Struct(StructType),
}

impl<S: Into<PrimaryType>> From<S> for AnyType {
    fn from(value: S) -> Self {
        AnyType::Primary(value.into())
    }
}

impl From<ArrayType> for AnyType {
    fn from(value: ArrayType) -> Self {
        AnyType::Array(value)
    }
}

impl From<StructType> for AnyType {
    fn from(value: StructType) -> Self {
        AnyType::Struct(value)
    }
}

impl AnyType {
    /// Build a formatting helper that renders this type using the provided
    /// registry to resolve referenced element types.
    ///
    /// Example:
    /// ```rust
    /// # use byinstr::types::{AnyType, TypeRegistry, primary::IType};
    /// let reg = TypeRegistry::new();
    /// let t = AnyType::from(IType::I32);
    /// assert_eq!(format!("{}", t.fmt(&reg)), "i32");
    /// ```
    pub fn fmt<'a>(&'a self, registry: &'a TypeRegistry) -> impl std::fmt::Display + 'a {
        struct AnyTypeFmt<'a> {
            ty: &'a AnyType,
            registry: &'a TypeRegistry,
        }

        impl std::fmt::Display for AnyTypeFmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.ty {
                    AnyType::Primary(primary_type) => primary_type.fmt(f),
                    AnyType::Array(array_type) => array_type.fmt(self.registry).fmt(f),
                    AnyType::Struct(struct_type) => struct_type.fmt(self.registry).fmt(f),
                }
            }
        }

        AnyTypeFmt { ty: self, registry }
    }
}

/// A central registry that stores and deduplicates `AnyType` values.
///
/// The registry provides fast lookup by `Typeref` and ensures identical type
/// descriptions map to the same identifier.
///
/// Example:
///
/// ```rust
/// # use byinstr::types::{TypeRegistry, primary::IType};
/// let reg = TypeRegistry::new();
/// let typeref = reg.search_or_insert(IType::I8.into());
/// assert_eq!(reg.search_or_insert(IType::I8.into()), typeref);
/// assert_eq!(reg.get(typeref).as_deref(), Some(&IType::I8.into()));
/// ```
#[derive(Default)]
pub struct TypeRegistry {
    array: RwLock<Vec<AnyType>>,
    inverse_lookup: RwLock<BTreeMap<u64, SmallVec<[Typeref; 1]>>>,
}

impl TypeRegistry {
    fn hash_ty(ty: &AnyType) -> u64 {
        let mut hasher = DefaultHasher::new();
        ty.hash(&mut hasher);
        hasher.finish()
    }

    /// Create a new, empty [`TypeRegistry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve a borrowed [`AnyType`] for the given `typeref`. Returns
    /// [`None`] if the given `typeref` is not present in the registry.
    ///
    /// # A note on concurrency
    /// The returned guard keeps a read lock held for its lifetime. You mustn't
    /// hold it while calling [`Self::search_or_insert`] as the insertion may
    /// need the write lock. Prefer [`Self::lookup`] when an owned copy is fine.
    pub fn get(&self, typeref: Typeref) -> Option<MappedRwLockReadGuard<'_, AnyType>> {
        let array_lock = self.array.read_recursive();
        RwLockReadGuard::try_map(array_lock, |types| types.get(typeref.0 as usize)).ok()
    }

    /// Owned copy of the type behind `typeref`.
    pub fn lookup(&self, typeref: Typeref) -> Option<AnyType> {
        self.get(typeref).map(|guard| guard.clone())
    }

    /// Insert `ty` into the registry if an equivalent type doesn't already
    /// exist and return the [`Typeref`] for it.
    ///
    /// # About hash collisions
    /// The registry uses a hash-based inverse lookup to quickly find candidate
    /// types. Collisions only degrade lookups to a linear scan of the colliding
    /// bucket; they never alias two different types.
    pub fn search_or_insert(&self, ty: AnyType) -> Typeref {
        let h = Self::hash_ty(&ty);

        // Lock, notice that the order is critical, always lock the storage first
        let mut array_lock = self.array.upgradable_read();
        let mut inverse_lookup_lock = self.inverse_lookup.upgradable_read();

        if let Some(typerefs) = inverse_lookup_lock.get(&h) {
            for typeref in typerefs {
                if array_lock[typeref.0 as usize] == ty {
                    return *typeref;
                }
            }
        }

        // NOTE: Ordering of upgrade is paramount to avoid deadlock
        array_lock.with_upgraded(|array_lock| {
            inverse_lookup_lock.with_upgraded(|inverse_lookup_lock| {
                let new_typeref = Typeref(array_lock.len() as u32);

                if let Some(list) = inverse_lookup_lock.get_mut(&h) {
                    info!(
                        "Detected an hash collision on hash 0x{:016x} ({} existing entries)",
                        h,
                        list.len()
                    );
                    list.push(new_typeref);
                } else {
                    debug!("New type encountered {:?}. Registered as {:?}.", ty, new_typeref);
                    inverse_lookup_lock.insert(h, smallvec![new_typeref]);
                }

                array_lock.push(ty);
                new_typeref
            })
        })
    }

    /// Shorthand for an integer type of `num_bits` bits.
    ///
    /// # Panics
    /// Panics if `num_bits` is outside of [`IType::MIN_BITS`]..=[`IType::MAX_BITS`].
    pub fn int(&self, num_bits: u32) -> Typeref {
        let itype = IType::new(num_bits).expect("integer width out of range");
        self.search_or_insert(itype.into())
    }

    /// Shorthand for a floating-point type.
    pub fn float(&self, ftype: FType) -> Typeref {
        self.search_or_insert(ftype.into())
    }

    /// Shorthand for the opaque pointer type.
    pub fn ptr(&self) -> Typeref {
        self.search_or_insert(PtrType.into())
    }

    /// Shorthand for a fixed-size vector type.
    pub fn vector(&self, ty: impl Into<PrimaryBasicType>, num_elements: u16) -> Typeref {
        self.search_or_insert(
            VcType {
                ty: ty.into(),
                size: VectorSize::Fixed(num_elements),
            }
            .into(),
        )
    }

    /// Shorthand for an array type.
    pub fn array(&self, ty: Typeref, num_elements: u64) -> Typeref {
        self.search_or_insert(ArrayType { ty, num_elements }.into())
    }

    /// Shorthand for a (packed) structure type.
    pub fn structure(&self, element_types: Vec<Typeref>) -> Typeref {
        self.search_or_insert(StructType { element_types }.into())
    }

    /// Storage size of a value of type `typeref`, in bytes.
    ///
    /// Vectors are densely packed, arrays multiply their element size, and
    /// structures are the sum of their fields. Returns `None` for unknown
    /// references.
    pub fn byte_size(&self, typeref: Typeref) -> Option<u64> {
        Some(match self.lookup(typeref)? {
            AnyType::Primary(PrimaryType::Int(itype)) => itype.byte_size() as u64,
            AnyType::Primary(PrimaryType::Float(ftype)) => ftype.byte_size() as u64,
            AnyType::Primary(PrimaryType::Ptr(_)) => PtrType::BYTE_SIZE as u64,
            AnyType::Primary(PrimaryType::Vc(vc)) => {
                vc.ty.byte_size() as u64 * vc.size.min_elements() as u64
            }
            AnyType::Array(array) => self.byte_size(array.ty)? * array.num_elements,
            AnyType::Struct(st) => {
                let mut total = 0;
                for field in st.element_types {
                    total += self.byte_size(field)?;
                }
                total
            }
        })
    }

    /// Byte offset of field `index` inside the structure `typeref`.
    pub fn field_offset(&self, typeref: Typeref, index: usize) -> Option<u64> {
        match self.lookup(typeref)? {
            AnyType::Struct(st) => {
                let mut offset = 0;
                for field in st.element_types.iter().take(index) {
                    offset += self.byte_size(*field)?;
                }
                Some(offset)
            }
            _ => None,
        }
    }

    /// Size in bits of a *primitive* value of this type.
    ///
    /// Integers and floats report their width and vectors report the width of
    /// all their lanes together. Pointers and aggregates are not primitive and
    /// report `0`.
    pub fn primitive_bits(&self, typeref: Typeref) -> u64 {
        match self.lookup(typeref) {
            Some(AnyType::Primary(PrimaryType::Int(itype))) => itype.num_bits() as u64,
            Some(AnyType::Primary(PrimaryType::Float(ftype))) => ftype.num_bits() as u64,
            Some(AnyType::Primary(PrimaryType::Vc(vc))) => match vc.ty {
                PrimaryBasicType::Ptr(_) => 0,
                elem => elem.num_bits() as u64 * vc.size.min_elements() as u64,
            },
            _ => 0,
        }
    }

    /// The vector shape of `typeref`, if it is a vector type.
    pub fn vector_shape(&self, typeref: Typeref) -> Option<VcType> {
        match self.lookup(typeref)? {
            AnyType::Primary(PrimaryType::Vc(vc)) => Some(vc),
            _ => None,
        }
    }

    /// Element type of an array or the scalar element of a vector.
    pub fn element_type(&self, typeref: Typeref) -> Option<Typeref> {
        match self.lookup(typeref)? {
            AnyType::Array(array) => Some(array.ty),
            AnyType::Primary(PrimaryType::Vc(vc)) => {
                Some(self.search_or_insert(PrimaryType::from(vc.ty).into()))
            }
            _ => None,
        }
    }

    /// Result type of a comparison over operands of type `operand`: `i1`, or
    /// a vector of `i1` with the same shape when comparing vectors.
    pub fn comparison_result(&self, operand: Typeref) -> Typeref {
        match self.vector_shape(operand) {
            Some(vc) => self.search_or_insert(
                VcType {
                    ty: IType::I1.into(),
                    size: vc.size,
                }
                .into(),
            ),
            None => self.search_or_insert(IType::I1.into()),
        }
    }

    /// Returns true if `typeref` is a floating-point scalar or a vector of floating-point lanes.
    pub fn is_fp_or_fp_vector(&self, typeref: Typeref) -> bool {
        match self.lookup(typeref) {
            Some(AnyType::Primary(PrimaryType::Float(_))) => true,
            Some(AnyType::Primary(PrimaryType::Vc(vc))) => vc.ty.is_float(),
            _ => false,
        }
    }

    /// Format a given `Typeref` using this registry.
    pub fn fmt(&self, typeref: Typeref) -> impl std::fmt::Display + '_ {
        struct Fmt<'a> {
            registry: &'a TypeRegistry,
            typeref: Typeref,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.registry.lookup(self.typeref) {
                    Some(ty) => ty.fmt(self.registry).fmt(f),
                    None => write!(f, "<unknown type {}>", self.typeref.0),
                }
            }
        }

        Fmt {
            registry: self,
            typeref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_deduplicates_and_sizes_types() {
        let reg = TypeRegistry::new();
        let i32_ty = reg.int(32);
        assert_eq!(reg.int(32), i32_ty);

        let v4 = reg.vector(IType::I32, 4);
        assert_eq!(reg.byte_size(v4), Some(16));
        assert_eq!(reg.primitive_bits(v4), 128);

        let ptr = reg.ptr();
        assert_eq!(reg.byte_size(ptr), Some(8));
        assert_eq!(reg.primitive_bits(ptr), 0);

        let arr = reg.array(reg.int(64), 10);
        assert_eq!(reg.byte_size(arr), Some(80));
        assert_eq!(reg.primitive_bits(arr), 0);

        let st = reg.structure(vec![reg.int(64), ptr, reg.int(32)]);
        assert_eq!(reg.byte_size(st), Some(20));
        assert_eq!(reg.field_offset(st, 2), Some(16));
    }

    #[test]
    fn registry_formats_nested_types() {
        let reg = TypeRegistry::new();
        let arr = reg.array(reg.array(reg.int(64), 3), 2);
        assert_eq!(format!("{}", reg.fmt(arr)), "[2 x [3 x i64]]");
        let v = reg.vector(FType::Fp32, 8);
        assert_eq!(format!("{}", reg.fmt(v)), "<8 x fp32>");
    }
}
