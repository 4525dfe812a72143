//! Miscellaneous instructions: calls, conversions, selection and phi nodes.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};

use crate::{
    modules::{
        Instruction,
        operand::{Label, Name, Operand},
    },
    types::{TypeRegistry, Typeref},
};

/// Function call.
///
/// `function` is usually an [`Operand::Function`] naming the callee; any
/// other operand is an indirect call through a pointer. `ty` is the return
/// type, `None` for `void` callees (in which case `dest` is `None` too).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Call {
    pub dest: Option<Name>,
    pub ty: Option<Typeref>,
    pub function: Operand,
    pub args: Vec<Operand>,
}

impl Call {
    /// Name of the callee for direct calls.
    pub fn callee(&self) -> Option<&str> {
        self.function.as_function()
    }
}

impl Instruction for Call {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.function).chain(self.args.iter())
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.function).chain(self.args.iter_mut())
    }

    fn destination(&self) -> Option<Name> {
        self.dest
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = Some(name);
    }

    fn destination_type(&self, _registry: &TypeRegistry) -> Option<Typeref> {
        self.dest.and(self.ty)
    }
}

/// Conversion operations
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    PtrToInt,
    IntToPtr,
    Bitcast,
}

impl CastOp {
    /// Creates a [`CastOp`] from its string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        CastOp::iter().find(|op| op.to_str() == s)
    }

    /// Returns the string representation of the [`CastOp`].
    pub fn to_str(&self) -> &'static str {
        match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::FpTrunc => "fptrunc",
            CastOp::FpExt => "fpext",
            CastOp::FpToUi => "fptoui",
            CastOp::FpToSi => "fptosi",
            CastOp::UiToFp => "uitofp",
            CastOp::SiToFp => "sitofp",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
            CastOp::Bitcast => "bitcast",
        }
    }
}

/// Convert `value` from `from_ty` to `to_ty`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cast {
    pub dest: Name,
    pub op: CastOp,
    pub from_ty: Typeref,
    pub to_ty: Typeref,
    pub value: Operand,
}

impl Instruction for Cast {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.value)
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.value)
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, _registry: &TypeRegistry) -> Option<Typeref> {
        Some(self.to_ty)
    }
}

/// `cond ? on_true : on_false`, both of type `ty`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Select {
    pub dest: Name,
    pub ty: Typeref,
    pub cond: Operand,
    pub on_true: Operand,
    pub on_false: Operand,
}

impl Instruction for Select {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.cond, &self.on_true, &self.on_false].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.cond, &mut self.on_true, &mut self.on_false].into_iter()
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, _registry: &TypeRegistry) -> Option<Typeref> {
        Some(self.ty)
    }
}

/// SSA merge of values flowing in from predecessor blocks.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Phi {
    pub dest: Name,
    pub ty: Typeref,
    pub values: Vec<(Label, Operand)>,
}

impl Phi {
    /// Value flowing in from `pred`.
    pub fn incoming(&self, pred: Label) -> Option<&Operand> {
        self.values
            .iter()
            .find(|(label, _)| *label == pred)
            .map(|(_, value)| value)
    }
}

impl Instruction for Phi {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        self.values.iter().map(|(_, value)| value)
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        self.values.iter_mut().map(|(_, value)| value)
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, _registry: &TypeRegistry) -> Option<Typeref> {
        Some(self.ty)
    }
}
