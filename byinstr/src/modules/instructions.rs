use auto_enums::auto_enum;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumDiscriminants, EnumIs, EnumIter, EnumTryAs};

use crate::{
    modules::{Instruction, fp, int, mem, misc, operand::Operand},
    types::{TypeRegistry, Typeref},
};

/// Discriminated union covering all public instruction kinds.
///
/// Use this enum to store heterogeneous instruction streams and to pattern‑match
/// on specific operations. The generated [`Opcode`] discriminant (via
/// `strum`) is dense and iterable, which makes it usable as a histogram index.
#[derive(Debug, Clone, Hash, PartialEq, Eq, EnumIs, EnumTryAs, EnumDiscriminants)]
#[strum_discriminants(name(Opcode), derive(EnumIter, EnumCount, Hash, PartialOrd, Ord))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Instr {
    // Integer instructions
    IAdd(int::IAdd),
    ISub(int::ISub),
    IMul(int::IMul),
    IDiv(int::IDiv),
    IRem(int::IRem),
    ICmp(int::ICmp),
    ISht(int::ISht),
    INeg(int::INeg),

    // Bitwise instructions
    IAnd(int::IAnd),
    IOr(int::IOr),
    IXor(int::IXor),
    INot(int::INot),

    // Floating-point instructions
    FAdd(fp::FAdd),
    FSub(fp::FSub),
    FMul(fp::FMul),
    FDiv(fp::FDiv),
    FRem(fp::FRem),
    FCmp(fp::FCmp),
    FNeg(fp::FNeg),

    // Memory instructions
    MLoad(mem::MLoad),
    MStore(mem::MStore),
    MAlloca(mem::MAlloca),
    MGetElementPtr(mem::MGetElementPtr),

    // Miscellaneous instructions
    Call(misc::Call),
    Cast(misc::Cast),
    Select(misc::Select),
    Phi(misc::Phi),
}

impl Opcode {
    /// Dense index of the opcode, in `0..Opcode::COUNT`.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Mnemonic of the opcode.
    pub fn opname(&self) -> &'static str {
        match self {
            Opcode::IAdd => "add",
            Opcode::ISub => "sub",
            Opcode::IMul => "mul",
            Opcode::IDiv => "div",
            Opcode::IRem => "rem",
            Opcode::ICmp => "icmp",
            Opcode::ISht => "shift",
            Opcode::INeg => "neg",
            Opcode::IAnd => "and",
            Opcode::IOr => "or",
            Opcode::IXor => "xor",
            Opcode::INot => "not",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::FRem => "frem",
            Opcode::FCmp => "fcmp",
            Opcode::FNeg => "fneg",
            Opcode::MLoad => "load",
            Opcode::MStore => "store",
            Opcode::MAlloca => "alloca",
            Opcode::MGetElementPtr => "getelementptr",
            Opcode::Call => "call",
            Opcode::Cast => "cast",
            Opcode::Select => "select",
            Opcode::Phi => "phi",
        }
    }
}

impl Instr {
    /// Discriminant of this instruction.
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self)
    }

    /// Mnemonic of this instruction.
    pub fn opname(&self) -> &'static str {
        self.opcode().opname()
    }
}

macro_rules! define_instr_any_instr {
    (
        $($variant:ident),*
    ) => {
        impl Instruction for Instr {
            #[auto_enum(Iterator)]
            fn operands(&self) -> impl Iterator<Item = &Operand> {
                match self {
                    $(
                        Instr::$variant(instr) => instr.operands(),
                    )*
                }
            }

            #[auto_enum(Iterator)]
            fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
                match self {
                    $(
                        Instr::$variant(instr) => instr.operands_mut(),
                    )*
                }
            }

            fn destination(&self) -> Option<super::operand::Name> {
                match self {
                    $(
                        Instr::$variant(instr) => instr.destination(),
                    )*
                }
            }

            fn set_destination(&mut self, name: super::operand::Name) {
                match self {
                    $(
                        Instr::$variant(instr) => instr.set_destination(name),
                    )*
                }
            }

            fn destination_type(&self, registry: &TypeRegistry) -> Option<Typeref> {
                match self {
                    $(
                        Instr::$variant(instr) => instr.destination_type(registry),
                    )*
                }
            }
        }
    };
}

define_instr_any_instr! {
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    ICmp,
    ISht,
    INeg,
    IAnd,
    IOr,
    IXor,
    INot,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    FCmp,
    FNeg,
    MLoad,
    MStore,
    MAlloca,
    MGetElementPtr,
    Call,
    Cast,
    Select,
    Phi
}

macro_rules! define_instr_from {
    ($typ:ty, $variant:ident) => {
        impl From<$typ> for Instr {
            fn from(inst: $typ) -> Self {
                Instr::$variant(inst)
            }
        }
    };
}

define_instr_from!(int::IAdd, IAdd);
define_instr_from!(int::ISub, ISub);
define_instr_from!(int::IMul, IMul);
define_instr_from!(int::IDiv, IDiv);
define_instr_from!(int::IRem, IRem);
define_instr_from!(int::ICmp, ICmp);
define_instr_from!(int::ISht, ISht);
define_instr_from!(int::INeg, INeg);
define_instr_from!(int::IAnd, IAnd);
define_instr_from!(int::IOr, IOr);
define_instr_from!(int::IXor, IXor);
define_instr_from!(int::INot, INot);

define_instr_from!(fp::FAdd, FAdd);
define_instr_from!(fp::FSub, FSub);
define_instr_from!(fp::FMul, FMul);
define_instr_from!(fp::FDiv, FDiv);
define_instr_from!(fp::FRem, FRem);
define_instr_from!(fp::FCmp, FCmp);
define_instr_from!(fp::FNeg, FNeg);

define_instr_from!(mem::MLoad, MLoad);
define_instr_from!(mem::MStore, MStore);
define_instr_from!(mem::MAlloca, MAlloca);
define_instr_from!(mem::MGetElementPtr, MGetElementPtr);

define_instr_from!(misc::Call, Call);
define_instr_from!(misc::Cast, Cast);
define_instr_from!(misc::Select, Select);
define_instr_from!(misc::Phi, Phi);

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcodes_are_dense_and_named() {
        for (i, opcode) in Opcode::iter().enumerate() {
            assert_eq!(opcode.index(), i);
            assert!(!opcode.opname().is_empty());
        }
        assert_eq!(Opcode::iter().count(), Opcode::COUNT);
    }
}
