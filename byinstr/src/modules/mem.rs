//! Memory operations
//!
//! Loads and stores with alignment and volatility, stack allocation, and
//! typed address computation. Pointers are opaque: every access states the
//! type it reads or writes.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    modules::{
        Instruction,
        operand::{Name, Operand},
    },
    types::{TypeRegistry, Typeref},
};

/// Load a value of type `ty` from `addr` into a destination SSA name.
///
/// When `volatile` is true, the operation is prevented from being removed or
/// merged by typical optimizations.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MLoad {
    pub dest: Name,
    pub ty: Typeref,
    pub addr: Operand,
    pub alignment: Option<u32>,
    pub volatile: bool,
}

impl Instruction for MLoad {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.addr)
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.addr)
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

/// Store `value` of type `ty` to `addr`.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MStore {
    pub addr: Operand,
    pub value: Operand,
    pub ty: Typeref,
    pub alignment: Option<u32>,
    pub volatile: bool,
}

impl Instruction for MStore {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.value, &self.addr].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.value, &mut self.addr].into_iter()
    }
}

/// Reserve stack space for `count` values of type `ty`. Produces a pointer.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MAlloca {
    pub dest: Name,
    pub ty: Typeref,
    pub count: Operand,
    pub alignment: Option<u32>,
}

impl Instruction for MAlloca {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.count)
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.count)
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, registry: &TypeRegistry) -> Option<Typeref> {
        Some(registry.ptr())
    }
}

/// Address computation relative to `base`.
///
/// The first index steps over whole values of type `ty`; every following
/// index selects an element of the current array or vector, or a field of
/// the current structure (field indices must be constants).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MGetElementPtr {
    pub dest: Name,
    pub ty: Typeref,
    pub base: Operand,
    pub indices: SmallVec<[Operand; 2]>,
}

impl Instruction for MGetElementPtr {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.base).chain(self.indices.iter())
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.base).chain(self.indices.iter_mut())
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }

    fn set_destination(&mut self, name: Name) {
        self.dest = name;
    }

    fn destination_type(&self, registry: &TypeRegistry) -> Option<Typeref> {
        Some(registry.ptr())
    }
}
