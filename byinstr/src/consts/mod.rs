//! Constants used as immediate operands and as global initializers.
use crate::types::{
    TypeRegistry, Typeref,
    primary::{FType, IType},
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;

/// An integer literal. Only the low `ty.num_bits()` bits of `value` are
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IConst {
    pub ty: IType,
    pub value: u64,
}

impl IConst {
    pub fn new(ty: IType, value: u64) -> Self {
        Self {
            ty,
            value: value & ty.mask(),
        }
    }
}

impl std::fmt::Display for IConst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ty, self.value)
    }
}

/// A floating-point literal paired with its `FType`.
///
/// The payload is kept as the bit pattern of an `f64` so that constants stay
/// `Eq` and `Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FConst {
    pub ty: FType,
    bits: u64,
}

impl FConst {
    pub fn new(ty: FType, value: f64) -> Self {
        Self {
            ty,
            bits: value.to_bits(),
        }
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits)
    }
}

impl std::fmt::Display for FConst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?}", self.ty, self.value())
    }
}

/// Any constant value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AnyConst {
    Int(IConst),
    Float(FConst),

    /// The null pointer.
    Null,

    /// All-zero value of the given type (`zeroinitializer`).
    Zero(Typeref),

    /// NUL-terminated byte string, typed `[len + 1 x i8]`.
    Str(String),

    /// Constant array of `elem` typed values.
    Array { elem: Typeref, elems: Vec<AnyConst> },

    /// Constant structure of type `ty`.
    Struct { ty: Typeref, fields: Vec<AnyConst> },

    /// Address of the named global symbol.
    GlobalAddr(String),
}

impl AnyConst {
    /// Integer constant of the given width.
    pub fn int(num_bits: u32, value: u64) -> Self {
        let ty = IType::new(num_bits).expect("integer width out of range");
        AnyConst::Int(IConst::new(ty, value))
    }

    pub fn i1(value: bool) -> Self {
        Self::int(1, value as u64)
    }

    pub fn i8(value: u8) -> Self {
        Self::int(8, value as u64)
    }

    pub fn i32(value: u32) -> Self {
        Self::int(32, value as u64)
    }

    pub fn i64(value: u64) -> Self {
        Self::int(64, value)
    }

    pub fn f64(value: f64) -> Self {
        AnyConst::Float(FConst::new(FType::Fp64, value))
    }

    /// Type of this constant, interned in `registry`.
    pub fn type_of(&self, registry: &TypeRegistry) -> Typeref {
        match self {
            AnyConst::Int(i) => registry.search_or_insert(i.ty.into()),
            AnyConst::Float(f) => registry.float(f.ty),
            AnyConst::Null | AnyConst::GlobalAddr(_) => registry.ptr(),
            AnyConst::Zero(ty) => *ty,
            AnyConst::Str(s) => registry.array(registry.int(8), s.len() as u64 + 1),
            AnyConst::Array { elem, elems } => registry.array(*elem, elems.len() as u64),
            AnyConst::Struct { ty, .. } => *ty,
        }
    }

    /// Integer payload, if this is an integer constant.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AnyConst::Int(i) => Some(i.value),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnyConst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyConst::Int(i) => i.fmt(f),
            AnyConst::Float(c) => c.fmt(f),
            AnyConst::Null => write!(f, "null"),
            AnyConst::Zero(_) => write!(f, "zeroinitializer"),
            AnyConst::Str(s) => write!(f, "c{:?}", s),
            AnyConst::Array { elems, .. } => {
                write!(f, "[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    elem.fmt(f)?;
                }
                write!(f, "]")
            }
            AnyConst::Struct { fields, .. } => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    field.fmt(f)?;
                }
                write!(f, " }}")
            }
            AnyConst::GlobalAddr(name) => write!(f, "@{}", name),
        }
    }
}
