//! Floating‑point instructions
//!
//! Arithmetic and comparisons over IEEE‑754 values and vectors of them.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};

use crate::{
    modules::{
        Instruction,
        operand::{Name, Operand},
    },
    types::{TypeRegistry, Typeref},
};

/// Floating-point comparison predicates. `O*` predicates are false when an
/// operand is NaN, `U*` predicates are true in that case.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FCmpOp {
    Oeq,
    One,
    Ogt,
    Oge,
    Olt,
    Ole,
    Ord,
    Ueq,
    Une,
    Ugt,
    Uge,
    Ult,
    Ule,
    Uno,
}

impl FCmpOp {
    /// Creates an [`FCmpOp`] from its string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        FCmpOp::iter().find(|op| op.to_str() == s)
    }

    /// Returns the string representation of the [`FCmpOp`].
    pub fn to_str(&self) -> &'static str {
        match self {
            FCmpOp::Oeq => "oeq",
            FCmpOp::One => "one",
            FCmpOp::Ogt => "ogt",
            FCmpOp::Oge => "oge",
            FCmpOp::Olt => "olt",
            FCmpOp::Ole => "ole",
            FCmpOp::Ord => "ord",
            FCmpOp::Ueq => "ueq",
            FCmpOp::Une => "une",
            FCmpOp::Ugt => "ugt",
            FCmpOp::Uge => "uge",
            FCmpOp::Ult => "ult",
            FCmpOp::Ule => "ule",
            FCmpOp::Uno => "uno",
        }
    }

    /// Evaluate the predicate.
    pub fn evaluate(&self, lhs: f64, rhs: f64) -> bool {
        let unordered = lhs.is_nan() || rhs.is_nan();
        match self {
            FCmpOp::Oeq => !unordered && lhs == rhs,
            FCmpOp::One => !unordered && lhs != rhs,
            FCmpOp::Ogt => !unordered && lhs > rhs,
            FCmpOp::Oge => !unordered && lhs >= rhs,
            FCmpOp::Olt => !unordered && lhs < rhs,
            FCmpOp::Ole => !unordered && lhs <= rhs,
            FCmpOp::Ord => !unordered,
            FCmpOp::Ueq => unordered || lhs == rhs,
            FCmpOp::Une => unordered || lhs != rhs,
            FCmpOp::Ugt => unordered || lhs > rhs,
            FCmpOp::Uge => unordered || lhs >= rhs,
            FCmpOp::Ult => unordered || lhs < rhs,
            FCmpOp::Ule => unordered || lhs <= rhs,
            FCmpOp::Uno => unordered,
        }
    }
}

define_binary_instr! {
    /// Floating-point addition
    FAdd
}

define_binary_instr! {
    /// Floating-point subtraction
    FSub
}

define_binary_instr! {
    /// Floating-point multiplication
    FMul
}

define_binary_instr! {
    /// Floating-point division
    FDiv
}

define_binary_instr! {
    /// Floating-point remainder
    FRem
}

define_unary_instr! {
    /// Floating-point negation
    FNeg
}

/// Floating-point comparison. `ty` is the operand type.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FCmp {
    pub dest: Name,
    pub ty: Typeref,
    pub lhs: Operand,
    pub rhs: Operand,
    pub op: FCmpOp,
}

impl Instruction for FCmp {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.lhs, &self.rhs].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.lhs, &mut self.rhs].into_iter()
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, registry: &TypeRegistry) -> Option<Typeref> {
        Some(registry.comparison_result(self.ty))
    }
}
