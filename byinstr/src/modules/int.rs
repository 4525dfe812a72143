//! Integer instructions
//!
//! Arithmetic, comparisons, shifts, and bitwise operations over integer
//! values (or vectors of integers). Each instruction carries its destination
//! `Name`, its operand `Typeref`, and its input operands. Signedness where
//! relevant is an explicit parameter of the instruction.
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

/// Signedness for integer operations
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IntegerSignedness {
    Signed,
    Unsigned,
}

impl IntegerSignedness {
    /// Creates an [`IntegerSignedness`] from its string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        IntegerSignedness::iter().find(|op| op.to_str() == s)
    }

    /// Returns the string representation of the [`IntegerSignedness`].
    pub fn to_str(&self) -> &'static str {
        match self {
            IntegerSignedness::Signed => "signed",
            IntegerSignedness::Unsigned => "unsigned",
        }
    }
}

/// Integer comparison operations
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ICmpOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Unsigned greater than
    Ugt,
    /// Unsigned greater than or equal
    Uge,
    /// Unsigned less than
    Ult,
    /// Unsigned less than or equal
    Ule,
    /// Signed greater than
    Sgt,
    /// Signed greater than or equal
    Sge,
    /// Signed less than
    Slt,
    /// Signed less than or equal
    Sle,
}

impl ICmpOp {
    /// Creates an [`ICmpOp`] from its string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        ICmpOp::iter().find(|op| op.to_str() == s)
    }

    /// Returns the string representation of the [`ICmpOp`].
    pub fn to_str(&self) -> &'static str {
        match self {
            ICmpOp::Eq => "eq",
            ICmpOp::Ne => "ne",
            ICmpOp::Ugt => "ugt",
            ICmpOp::Uge => "uge",
            ICmpOp::Ult => "ult",
            ICmpOp::Ule => "ule",
            ICmpOp::Sgt => "sgt",
            ICmpOp::Sge => "sge",
            ICmpOp::Slt => "slt",
            ICmpOp::Sle => "sle",
        }
    }

    /// Returns true if the comparison interprets its operands as signed.
    pub fn is_signed(&self) -> bool {
        matches!(self, ICmpOp::Sgt | ICmpOp::Sge | ICmpOp::Slt | ICmpOp::Sle)
    }
}

/// Integer shift operations disambiguation
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IShiftOp {
    /// Logical left shift
    Shl,
    /// Logical right shift
    LShr,
    /// Arithmetic right shift
    AShr,
}

impl IShiftOp {
    /// Creates an [`IShiftOp`] from its string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        IShiftOp::iter().find(|op| op.to_str() == s)
    }

    /// Returns the string representation of the [`IShiftOp`].
    pub fn to_str(&self) -> &'static str {
        match self {
            IShiftOp::Shl => "shl",
            IShiftOp::LShr => "lshr",
            IShiftOp::AShr => "ashr",
        }
    }
}

define_binary_instr! {
    /// Integer addition instruction (wrapping)
    IAdd
}

define_binary_instr! {
    /// Integer substraction instruction (wrapping)
    ISub
}

define_binary_instr! {
    /// Integer multiplication instruction (wrapping)
    IMul
}

define_binary_instr! {
    /// Integer division instruction
    IDiv { signedness: IntegerSignedness }
}

define_binary_instr! {
    /// Integer remainder instruction
    IRem { signedness: IntegerSignedness }
}

define_binary_instr! {
    /// Integer shift instruction. `rhs` holds the shift amount.
    ISht { op: IShiftOp }
}

define_binary_instr! {
    /// Bitwise and
    IAnd
}

define_binary_instr! {
    /// Bitwise or
    IOr
}

define_binary_instr! {
    /// Bitwise exclusive or
    IXor
}

define_unary_instr! {
    /// Two's complement negation
    INeg
}

define_unary_instr! {
    /// Bitwise complement
    INot
}

/// Integer comparison instruction
///
/// `ty` is the type of both operands; the result is an `i1` (or a vector of
/// `i1` when comparing vectors).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ICmp {
    pub dest: Name,
    pub ty: Typeref,
    pub lhs: Operand,
    pub rhs: Operand,
    pub op: ICmpOp,
}

impl Instruction for ICmp {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::primary::IType;

    #[test]
    fn comparison_yields_boolean_of_matching_shape() {
        let reg = TypeRegistry::new();
        let icmp = ICmp {
            dest: Name(2),
            ty: reg.vector(IType::I32, 4),
            lhs: Operand::Reg(Name(0)),
            rhs: Operand::Reg(Name(1)),
            op: ICmpOp::Slt,
        };
        let result = icmp.destination_type(&reg).unwrap();
        assert_eq!(format!("{}", reg.fmt(result)), "<4 x i1>");
        assert_eq!(icmp.dependencies().collect::<Vec<_>>(), vec![Name(0), Name(1)]);
    }

    #[test]
    fn opcode_strings_round_trip() {
        for op in ICmpOp::iter() {
            assert_eq!(ICmpOp::from_str(op.to_str()), Some(op));
        }
        assert_eq!(IShiftOp::from_str("ashr"), Some(IShiftOp::AShr));
        assert_eq!(IntegerSignedness::from_str("bogus"), None);
    }
}
