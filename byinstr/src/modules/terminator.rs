//! Module definitions for control flow instructions.
//!
//! Branching and flow control operations that end a basic block, including
//! conditional branches, jumps, switches, returns and invokes. Each
//! terminator specifies its target labels and input operands as needed.
use auto_enums::auto_enum;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumDiscriminants, EnumIs, EnumIter};

use crate::{
    modules::{
        Instruction,
        misc::Call,
        operand::{Label, Name, Operand},
    },
    types::Typeref,
};

/// Conditional branch instruction
///
/// See `Label` in `operand.rs` for more information about code labels.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CBranch {
    /// The condition operand; should evaluate to a boolean value.
    ///
    /// The condition is evaluated, and if it is true (non-zero), control
    /// transfers to `target_true`; otherwise, it transfers to `target_false`.
    pub cond: Operand,
    /// The label to jump to if the condition is true.
    pub target_true: Label,
    /// The label to jump to if the condition is false.
    pub target_false: Label,
}

/// Unconditional jump instruction
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Jump {
    /// The label to jump to.
    pub target: Label,
}

/// Multi-way branch on an integer value of type `ty`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Switch {
    pub value: Operand,
    pub ty: Typeref,
    /// Taken when no case matches.
    pub default: Label,
    pub cases: Vec<(u64, Label)>,
}

/// Return from function instruction. Optionally returns a value.
///
/// If `value` is `None`, it indicates a `void` return.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ret {
    pub value: Option<Operand>,
}

/// Trap instruction to indicate an unrecoverable error or exceptional condition.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Trap;

/// Call that transfers control to `normal` on return and to `unwind` when
/// the callee raises an exception.
///
/// The call result, if any, is only available in `normal` and the blocks it
/// dominates.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Invoke {
    pub call: Call,
    pub normal: Label,
    pub unwind: Label,
}

/// Control flow terminator instructions
#[derive(Debug, Clone, Hash, PartialEq, Eq, EnumIs, EnumDiscriminants)]
#[strum_discriminants(
    name(TerminatorKind),
    derive(EnumIter, EnumCount, Hash, PartialOrd, Ord)
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Terminator {
    Jump(Jump),
    CBranch(CBranch),
    Switch(Switch),
    Ret(Ret),
    Trap(Trap),
    Invoke(Invoke),
}

impl TerminatorKind {
    /// Dense index of the terminator kind, in `0..TerminatorKind::COUNT`.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn opname(&self) -> &'static str {
        match self {
            TerminatorKind::Jump => "br",
            TerminatorKind::CBranch => "condbr",
            TerminatorKind::Switch => "switch",
            TerminatorKind::Ret => "ret",
            TerminatorKind::Trap => "unreachable",
            TerminatorKind::Invoke => "invoke",
        }
    }
}

impl Terminator {
    pub fn kind(&self) -> TerminatorKind {
        TerminatorKind::from(self)
    }

    pub fn opname(&self) -> &'static str {
        self.kind().opname()
    }

    /// Returns true if the successor depends on a runtime value.
    pub fn is_conditional(&self) -> bool {
        matches!(self, Terminator::CBranch(_) | Terminator::Switch(_))
    }

    #[auto_enum(Iterator)]
    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        match self {
            Terminator::CBranch(cbranch) => std::iter::once(&cbranch.cond),
            Terminator::Jump(_) => std::iter::empty(),
            Terminator::Switch(switch) => std::iter::once(&switch.value),
            Terminator::Ret(ret) => ret.value.iter(),
            Terminator::Trap(_) => std::iter::empty(),
            Terminator::Invoke(invoke) => invoke.call.operands(),
        }
    }

    pub fn dependencies(&self) -> impl Iterator<Item = Name> {
        self.operands().filter_map(|op| op.as_reg())
    }

    #[auto_enum(Iterator)]
    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        match self {
            Terminator::CBranch(cbranch) => std::iter::once(&mut cbranch.cond),
            Terminator::Jump(_) => std::iter::empty(),
            Terminator::Switch(switch) => std::iter::once(&mut switch.value),
            Terminator::Ret(ret) => ret.value.iter_mut(),
            Terminator::Trap(_) => std::iter::empty(),
            Terminator::Invoke(invoke) => invoke.call.operands_mut(),
        }
    }

    /// Name defined by the terminator (the result of an invoke).
    pub fn destination(&self) -> Option<Name> {
        match self {
            Terminator::Invoke(invoke) => invoke.call.dest,
            _ => None,
        }
    }

    /// Type of the value returned by [`Self::destination`].
    pub fn destination_type(&self) -> Option<Typeref> {
        match self {
            Terminator::Invoke(invoke) => invoke.call.dest.and(invoke.call.ty),
            _ => None,
        }
    }

    /// Successor labels, in terminator order. A label may appear more than once.
    #[auto_enum(Iterator)]
    pub fn iter_targets(&self) -> impl Iterator<Item = Label> + '_ {
        match self {
            Terminator::CBranch(cbranch) => [cbranch.target_true, cbranch.target_false].into_iter(),
            Terminator::Jump(jump) => std::iter::once(jump.target),
            Terminator::Switch(switch) => std::iter::once(switch.default)
                .chain(switch.cases.iter().map(|(_, label)| *label)),
            Terminator::Ret(_) => std::iter::empty(),
            Terminator::Trap(_) => std::iter::empty(),
            Terminator::Invoke(invoke) => [invoke.normal, invoke.unwind].into_iter(),
        }
    }

    /// Replace every occurrence of the successor `from` by `to`.
    pub fn retarget(&mut self, from: Label, to: Label) {
        let swap = |label: &mut Label| {
            if *label == from {
                *label = to;
            }
        };
        match self {
            Terminator::CBranch(cbranch) => {
                swap(&mut cbranch.target_true);
                swap(&mut cbranch.target_false);
            }
            Terminator::Jump(jump) => swap(&mut jump.target),
            Terminator::Switch(switch) => {
                swap(&mut switch.default);
                for (_, label) in switch.cases.iter_mut() {
                    swap(label);
                }
            }
            Terminator::Ret(_) | Terminator::Trap(_) => {}
            Terminator::Invoke(invoke) => {
                swap(&mut invoke.normal);
                swap(&mut invoke.unwind);
            }
        }
    }
}

macro_rules! define_terminator_from {
    ($typ:ty, $variant:ident) => {
        impl From<$typ> for Terminator {
            fn from(inst: $typ) -> Self {
                Terminator::$variant(inst)
            }
        }
    };
}

define_terminator_from!(CBranch, CBranch);
define_terminator_from!(Jump, Jump);
define_terminator_from!(Switch, Switch);
define_terminator_from!(Ret, Ret);
define_terminator_from!(Trap, Trap);
define_terminator_from!(Invoke, Invoke);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_rewrites_every_matching_successor() {
        let mut term: Terminator = Switch {
            value: Operand::Reg(Name(0)),
            ty: crate::types::TypeRegistry::new().int(32),
            default: Label(2),
            cases: vec![(1, Label(1)), (2, Label(2))],
        }
        .into();
        term.retarget(Label(2), Label(7));
        assert_eq!(
            term.iter_targets().collect::<Vec<_>>(),
            vec![Label(7), Label(1), Label(7)]
        );
        assert!(term.is_conditional());
    }
}
