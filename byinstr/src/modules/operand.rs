//! Shared operand types for instructions.
//!
//! An instruction operand can be a reference to another SSA value (`Reg`),
//! an immediate constant (`Imm`), or the address of a module-level symbol
//! (`Global` for variables, `Function` for functions).
use std::collections::BTreeMap;

use crate::{
    consts::AnyConst,
    types::{TypeRegistry, Typeref},
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;

/// SSA value identifier used to name the destination or reference another
/// instruction's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Name(pub u32);

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Represents a code label used as a target for control‑flow instructions.
///
/// Labels and control-flow may not cross function boundaries. Thus, labels
/// are only valid within the function they are defined in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label(pub u32);

impl Label {
    pub const NIL: Label = Label(0);

    /// Returns true if this is the "nil" label (i.e., label 0).
    ///
    /// This label is reserved as the 'function entry' label. It should always be present.
    pub fn is_nil(&self) -> bool {
        self == &Label::NIL
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "label block_{}", self.0)
        } else {
            write!(f, "block_{}", self.0)
        }
    }
}

/// Instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// Reference to a previously defined SSA value.
    Reg(Name),
    /// Immediate literal.
    Imm(AnyConst),
    /// Address of a global variable.
    Global(String),
    /// Address of a function (internal or external).
    Function(String),
}

impl Operand {
    /// The SSA name referenced by this operand, if any.
    pub fn as_reg(&self) -> Option<Name> {
        match self {
            Operand::Reg(name) => Some(*name),
            _ => None,
        }
    }

    /// Name of the referenced function when the operand is a direct function reference.
    pub fn as_function(&self) -> Option<&str> {
        match self {
            Operand::Function(name) => Some(name),
            _ => None,
        }
    }

    /// Type of the operand. Registers are looked up in `values` (see
    /// [`crate::modules::Function::value_types`]); symbols are pointers.
    pub fn type_of(
        &self,
        values: &BTreeMap<Name, Typeref>,
        registry: &TypeRegistry,
    ) -> Option<Typeref> {
        match self {
            Operand::Reg(name) => values.get(name).copied(),
            Operand::Imm(constant) => Some(constant.type_of(registry)),
            Operand::Global(_) | Operand::Function(_) => Some(registry.ptr()),
        }
    }
}

impl From<Name> for Operand {
    fn from(name: Name) -> Self {
        Operand::Reg(name)
    }
}

impl From<AnyConst> for Operand {
    fn from(value: AnyConst) -> Self {
        Operand::Imm(value)
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(name) => write!(f, "{}", name),
            Operand::Imm(constant) => write!(f, "{}", constant),
            Operand::Global(name) => write!(f, "@{}", name),
            Operand::Function(name) => write!(f, "@{}", name),
        }
    }
}
