#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumIs, EnumTryAs};

/// Represents an integer type with a specific bit width.
///
/// Signeness is not represented here; all integer types are treated as unsigned.
/// Instructions that operate on signed integers will interpret the bits accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct IType {
    num_bits: u32,
}

impl IType {
    /// Common integer types.
    pub const I1: Self = Self { num_bits: 1 };
    pub const I8: Self = Self { num_bits: 8 };
    pub const I16: Self = Self { num_bits: 16 };
    pub const I32: Self = Self { num_bits: 32 };
    pub const I64: Self = Self { num_bits: 64 };
    pub const I128: Self = Self { num_bits: 128 };
    pub const MIN_BITS: u32 = 1;
    pub const MAX_BITS: u32 = (1 << 23) - 1;

    #[inline]
    const fn check_validity(num_bits: u32) -> bool {
        num_bits >= Self::MIN_BITS && num_bits <= Self::MAX_BITS
    }

    /// Creates a new `IType` with the specified number of bits.
    #[inline]
    pub const fn new(num_bits: u32) -> Option<Self> {
        if Self::check_validity(num_bits) {
            Some(Self { num_bits })
        } else {
            None
        }
    }

    /// Returns the number of bits of the integer type.
    #[inline]
    pub const fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Returns the number of bytes required to store the integer type.
    #[inline]
    pub const fn byte_size(&self) -> u32 {
        self.num_bits.div_ceil(8)
    }

    /// Mask selecting the low `num_bits` bits of a `u64` payload. Widths above
    /// 64 bits saturate to the full mask.
    #[inline]
    pub const fn mask(&self) -> u64 {
        if self.num_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.num_bits) - 1
        }
    }
}

impl std::fmt::Display for IType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.num_bits)
    }
}

/// Represents a floating-point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FType {
    /// 16-bit floating point value (IEEE-754 binary16)
    /// Also known as "half precision".
    Fp16,

    /// 16-bit "brain" floating point value (7-bit significand).
    Bf16,

    /// 32-bit floating point value (IEEE-754 binary32)
    /// Corresponds to Rust's `f32` type.
    Fp32,

    /// 64-bit floating point value (IEEE-754 binary64)
    /// Corresponds to Rust's `f64` type.
    Fp64,

    /// 128-bit floating point value (IEEE-754 binary128)
    Fp128,

    /// 80-bit floating point value (X87 extended precision)
    X86Fp80,

    /// 128-bit floating point value (two 64-bit values)
    PPCFp128,
}

impl FType {
    /// Number of value bits of the floating-point format.
    pub const fn num_bits(&self) -> u32 {
        match self {
            FType::Fp16 | FType::Bf16 => 16,
            FType::Fp32 => 32,
            FType::Fp64 => 64,
            FType::X86Fp80 => 80,
            FType::Fp128 | FType::PPCFp128 => 128,
        }
    }

    /// Storage size in bytes. `x86_fp80` occupies ten bytes in memory.
    pub const fn byte_size(&self) -> u32 {
        self.num_bits() / 8
    }
}

impl std::fmt::Display for FType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FType::Fp16 => "fp16",
            FType::Bf16 => "bf16",
            FType::Fp32 => "fp32",
            FType::Fp64 => "fp64",
            FType::Fp128 => "fp128",
            FType::X86Fp80 => "x86_fp80",
            FType::PPCFp128 => "ppc_fp128",
        };
        write!(f, "{}", s)
    }
}

/// Opaque pointer type.
///
/// Pointers do not carry their pointee type; loads and stores state the
/// accessed type explicitly. All pointers are [`PtrType::NUM_BITS`] wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PtrType;

impl PtrType {
    pub const NUM_BITS: u32 = 64;
    pub const BYTE_SIZE: u32 = Self::NUM_BITS / 8;
}

impl std::fmt::Display for PtrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ptr")
    }
}

/// Element type of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs, EnumTryAs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimaryBasicType {
    Int(IType),
    Float(FType),
    Ptr(PtrType),
}

impl PrimaryBasicType {
    /// Number of bits of a single element.
    pub const fn num_bits(&self) -> u32 {
        match self {
            PrimaryBasicType::Int(itype) => itype.num_bits(),
            PrimaryBasicType::Float(ftype) => ftype.num_bits(),
            PrimaryBasicType::Ptr(_) => PtrType::NUM_BITS,
        }
    }

    /// Number of bytes of a single element.
    pub const fn byte_size(&self) -> u32 {
        match self {
            PrimaryBasicType::Int(itype) => itype.byte_size(),
            PrimaryBasicType::Float(ftype) => ftype.byte_size(),
            PrimaryBasicType::Ptr(_) => PtrType::BYTE_SIZE,
        }
    }
}

impl From<IType> for PrimaryBasicType {
    fn from(itype: IType) -> Self {
        PrimaryBasicType::Int(itype)
    }
}

impl From<FType> for PrimaryBasicType {
    fn from(ftype: FType) -> Self {
        PrimaryBasicType::Float(ftype)
    }
}

impl From<PtrType> for PrimaryBasicType {
    fn from(ptrtype: PtrType) -> Self {
        PrimaryBasicType::Ptr(ptrtype)
    }
}

impl std::fmt::Display for PrimaryBasicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimaryBasicType::Int(itype) => write!(f, "{}", itype),
            PrimaryBasicType::Float(ftype) => write!(f, "{}", ftype),
            PrimaryBasicType::Ptr(ptrtype) => write!(f, "{}", ptrtype),
        }
    }
}

/// Size of a vector type, either fixed or scalable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VectorSize {
    /// Fixed size vector with the given number of elements.
    Fixed(u16),

    /// Scalable size vector where number of elements is a multiple of the given factor.
    Scalable(u16),
}

impl VectorSize {
    /// Number of elements known at compile time. For scalable vectors this is
    /// the minimum element count (`vscale == 1`).
    pub const fn min_elements(&self) -> u16 {
        match self {
            VectorSize::Fixed(n) | VectorSize::Scalable(n) => *n,
        }
    }
}

/// A vector type is a simple derived type that represents a vector of elements.
///
/// Vector types are used when multiple primitive data are operated in parallel using a single instruction (SIMD).
/// A vector type requires a size (number of elements), an underlying primitive data type, and a scalable property
/// to represent vectors where the exact hardware vector length is unknown at compile time.
///
/// Vector types are considered primary types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VcType {
    pub ty: PrimaryBasicType,
    pub size: VectorSize,
}

impl std::fmt::Display for VcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.size {
            VectorSize::Fixed(num) => write!(f, "<{} x {}>", num, self.ty),
            VectorSize::Scalable(num) => write!(f, "<vscale {} x {}>", num, self.ty),
        }
    }
}

/// Represents any primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs, EnumTryAs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimaryType {
    Int(IType),
    Float(FType),
    Ptr(PtrType),
    Vc(VcType),
}

macro_rules! primary_type_from {
    ($typ:ty, $lbl:ident) => {
        impl From<$typ> for PrimaryType {
            fn from(value: $typ) -> Self {
                PrimaryType::$lbl(value)
            }
        }
    };
}

primary_type_from! { IType, Int }
primary_type_from! { FType, Float }
primary_type_from! { PtrType, Ptr }
primary_type_from! { VcType, Vc }

impl From<PrimaryBasicType> for PrimaryType {
    fn from(value: PrimaryBasicType) -> Self {
        match value {
            PrimaryBasicType::Int(itype) => PrimaryType::Int(itype),
            PrimaryBasicType::Float(ftype) => PrimaryType::Float(ftype),
            PrimaryBasicType::Ptr(ptr) => PrimaryType::Ptr(ptr),
        }
    }
}

impl std::fmt::Display for PrimaryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimaryType::Int(itype) => itype.fmt(f),
            PrimaryType::Float(ftype) => ftype.fmt(f),
            PrimaryType::Ptr(ptr_type) => ptr_type.fmt(f),
            PrimaryType::Vc(vc_type) => vc_type.fmt(f),
        }
    }
}
