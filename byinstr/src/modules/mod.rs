//! Instruction IR modules
//!
//! This module groups all instruction kinds exposed by the IR together with
//! the containers that hold them. Each instruction is represented as a small
//! data structure with public fields, making it easy to construct and
//! inspect. Submodules contain families of operations:
//!
//! - `int`: integer arithmetic, comparisons, shifts and bitwise ops
//! - `fp`: floating‑point arithmetic and comparisons
//! - `mem`: loads, stores, stack allocation and address computation
//! - `misc`: calls, casts, selects and phi nodes
//! - `terminator`: block terminators (branches, switches, returns, invokes)
//! - `operand`: shared operand and SSA name types
//!
//! You typically manipulate instructions via the [`Instr`] enum which is a
//! tagged union of all concrete instruction forms.
//!
//! Beside the data model, [`BasicBlock`] and [`Function`] expose the editing
//! primitives an instrumentation pass relies on: splicing code at an
//! [`InsertionPoint`], splitting control-flow edges and splitting a block in
//! front of its terminator. Both splits keep phi nodes consistent.
use std::collections::{BTreeMap, BTreeSet};

use log::trace;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    modules::{
        instructions::Instr,
        operand::{Label, Name, Operand},
        symbol::{ExternalFunction, GlobalVariable},
        terminator::{Jump, Terminator},
    },
    types::{TypeRegistry, Typeref},
    utils::Error,
};

/// Defines an instruction reading two operands of type `ty` and producing a
/// value of the same type.
macro_rules! define_binary_instr {
    (
        $(#[$meta:meta])*
        $name:ident $({ $($(#[$fmeta:meta])* $field:ident : $fty:ty),* $(,)? })?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name {
            pub dest: $crate::modules::operand::Name,
            pub ty: $crate::types::Typeref,
            pub lhs: $crate::modules::operand::Operand,
            pub rhs: $crate::modules::operand::Operand,
            $($($(#[$fmeta])* pub $field: $fty,)*)?
        }

        impl $crate::modules::Instruction for $name {
            fn operands(&self) -> impl Iterator<Item = &$crate::modules::operand::Operand> {
                [&self.lhs, &self.rhs].into_iter()
            }

            fn operands_mut(
                &mut self,
            ) -> impl Iterator<Item = &mut $crate::modules::operand::Operand> {
                [&mut self.lhs, &mut self.rhs].into_iter()
            }

            fn destination(&self) -> Option<$crate::modules::operand::Name> {
                Some(self.dest)
            }

            fn set_destination(&mut self, name: $crate::modules::operand::Name) {
                self.dest = name;
            }

            fn destination_type(
                &self,
                _registry: &$crate::types::TypeRegistry,
            ) -> Option<$crate::types::Typeref> {
                Some(self.ty)
            }
        }
    };
}

/// Defines an instruction reading a single operand `value` of type `ty` and
/// producing a value of the same type.
macro_rules! define_unary_instr {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name {
            pub dest: $crate::modules::operand::Name,
            pub ty: $crate::types::Typeref,
            pub value: $crate::modules::operand::Operand,
        }

        impl $crate::modules::Instruction for $name {
            fn operands(&self) -> impl Iterator<Item = &$crate::modules::operand::Operand> {
                std::iter::once(&self.value)
            }

            fn operands_mut(
                &mut self,
            ) -> impl Iterator<Item = &mut $crate::modules::operand::Operand> {
                std::iter::once(&mut self.value)
            }

            fn destination(&self) -> Option<$crate::modules::operand::Name> {
                Some(self.dest)
            }

            fn set_destination(&mut self, name: $crate::modules::operand::Name) {
                self.dest = name;
            }

            fn destination_type(
                &self,
                _registry: &$crate::types::TypeRegistry,
            ) -> Option<$crate::types::Typeref> {
                Some(self.ty)
            }
        }
    };
}

pub mod fmt;
pub mod fp;
pub mod instructions;
pub mod int;
pub mod mem;
pub mod misc;
pub mod operand;
pub mod symbol;
pub mod terminator;

/// Common interface implemented by every instruction node.
///
/// This trait provides lightweight, zero‑allocation iteration over an
/// instruction's input operands and exposes its optional destination SSA
/// name when present.
pub trait Instruction {
    /// Iterate over all input operands for this instruction.
    fn operands(&self) -> impl Iterator<Item = &Operand>;

    /// Mutably iterate over all input operands for this instruction.
    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand>;

    /// Return the destination SSA name if the instruction produces a result.
    fn destination(&self) -> Option<Name> {
        None
    }

    /// Update the destination SSA name for this instruction. No-op if the
    /// instruction does not produce a result.
    fn set_destination(&mut self, _name: Name) {}

    /// Type of the produced value, if any.
    fn destination_type(&self, _registry: &TypeRegistry) -> Option<Typeref> {
        None
    }

    /// Convenience iterator over referenced SSA names (i.e., register
    /// operands). Immediates and symbols are ignored.
    fn dependencies(&self) -> impl Iterator<Item = Name> {
        self.operands().filter_map(|op| op.as_reg())
    }
}

/// All global variables and functions have one of the following types of linkage.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Linkage {
    /// Only directly accessible by objects in the current module.
    Private,

    /// Similar to [`Linkage::Private`], but the value shows as a local symbol
    /// in the object file.
    Internal,

    /// May be referenced by other modules, and may also be defined in other modules.
    #[default]
    External,

    /// Merged with other globals of the same name when linked. Unreferenced
    /// link-once globals may be discarded.
    LinkOnce,
}

/// A `file:line` source position.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

/// Debug record describing a source-level variable.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DebugVariable {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Position inside a [`BasicBlock`] where new code is spliced.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum InsertionPoint {
    /// Immediately before the instruction at the given index.
    Before(usize),
    /// Immediately after the instruction at the given index.
    After(usize),
    /// After the last instruction, i.e. just before the terminator.
    BlockEnd,
}

/// A basic block within a function, containing a sequence of instructions
/// and ending with a control flow terminator.
///
/// Blocks are identified by the [`Label`] under which they are stored in
/// [`Function::body`].
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BasicBlock {
    pub instructions: Vec<Instr>,
    pub terminator: Terminator,
}

impl BasicBlock {
    /// An empty block ending with `terminator`.
    pub fn new(terminator: impl Into<Terminator>) -> Self {
        Self {
            instructions: Vec::new(),
            terminator: terminator.into(),
        }
    }

    /// Splice `code` at `point`. Existing instructions keep their relative
    /// order; indices after the insertion point shift by `code.len()`.
    pub fn insert(&mut self, point: InsertionPoint, code: Vec<Instr>) -> Result<(), Error> {
        let len = self.instructions.len();
        let index = match point {
            InsertionPoint::Before(i) => i,
            InsertionPoint::After(i) => i + 1,
            InsertionPoint::BlockEnd => len,
        };

        if index > len {
            return Err(Error::InsertionOutOfBounds { index, len });
        }
        if code.is_empty() {
            return Ok(());
        }

        let tail = self.instructions.split_off(index);
        self.instructions.extend(code);
        self.instructions.extend(tail);
        Ok(())
    }

    /// Phi nodes at the head of the block.
    pub fn phis(&self) -> impl Iterator<Item = &misc::Phi> {
        self.instructions
            .iter()
            .map_while(|instr| match instr {
                Instr::Phi(phi) => Some(phi),
                _ => None,
            })
    }

    /// Rename the incoming block `from` to `to` in every phi of this block.
    pub fn relabel_phis(&mut self, from: Label, to: Label) {
        for instr in self.instructions.iter_mut() {
            if let Instr::Phi(phi) = instr {
                for (label, _) in phi.values.iter_mut() {
                    if *label == from {
                        *label = to;
                    }
                }
            }
        }
    }
}

/// A function made of basic blocks and parameter metadata.
///
/// A `Function` owns its control‑flow graph (`body`). Parameters are
/// represented as a list of `(Name, Typeref)` pairs. By convention the
/// entrypoint is the basic block labelled [`Label::NIL`].
///
/// Debug records are optional: `source` is the definition site, `locals`
/// maps stack allocations to the variable they hold and `locations` maps
/// instruction results to the source position that produced them.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Function {
    pub name: String,
    pub params: Vec<(Name, Typeref)>,
    pub return_type: Option<Typeref>,
    pub body: BTreeMap<Label, BasicBlock>,
    pub linkage: Linkage,
    pub source: Option<SourceLoc>,
    pub locals: BTreeMap<Name, DebugVariable>,
    pub locations: BTreeMap<Name, SourceLoc>,
}

impl Function {
    /// A function without body, debug records or parameters.
    pub fn new(name: impl Into<String>, return_type: Option<Typeref>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type,
            body: BTreeMap::new(),
            linkage: Linkage::default(),
            source: None,
            locals: BTreeMap::new(),
            locations: BTreeMap::new(),
        }
    }

    /// The entry block, if present.
    pub fn entry(&self) -> Option<&BasicBlock> {
        self.body.get(&Label::NIL)
    }

    /// Iterate over every instruction in block order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instr> {
        self.body.values().flat_map(|bb| bb.instructions.iter())
    }

    /// Find next available [`Name`], strictly above every defined or
    /// referenced name.
    pub fn next_available_name(&self) -> Name {
        let mut max_index: Option<u32> = None;
        let mut observe = |name: Name| {
            max_index = Some(max_index.map_or(name.0, |m| m.max(name.0)));
        };

        for (name, _) in &self.params {
            observe(*name);
        }

        for bb in self.body.values() {
            for instr in &bb.instructions {
                instr.destination().into_iter().for_each(&mut observe);
                instr.dependencies().for_each(&mut observe);
            }
            bb.terminator.destination().into_iter().for_each(&mut observe);
            bb.terminator.dependencies().for_each(&mut observe);
        }

        Name(max_index.map_or(0, |m| m + 1))
    }

    /// Find next available [`Label`]. New labels always sort after existing
    /// ones, so blocks added by a pass come after the original blocks.
    pub fn next_available_label(&self) -> Label {
        self.body
            .last_key_value()
            .map_or(Label::NIL, |(label, _)| Label(label.0 + 1))
    }

    /// Store `block` under a fresh label and return it.
    pub fn insert_block(&mut self, block: BasicBlock) -> Label {
        let label = self.next_available_label();
        self.body.insert(label, block);
        label
    }

    /// Verify SSA form:
    /// 1) The entry block exists and every branch target is defined.
    /// 2) Each name is defined exactly once.
    /// 3) Each operand refers to a defined name.
    /// 4) Phi nodes lead their block.
    pub fn check_ssa(&self) -> Result<(), Error> {
        let mut defined_names = BTreeSet::new();

        // Ensure existence of entry block
        if !self.body.contains_key(&Label::NIL) {
            return Err(Error::MissingEntryBlock {
                function: self.name.clone(),
            });
        }

        let mut define = |name: Name| {
            if defined_names.insert(name) {
                Ok(())
            } else {
                Err(Error::DuplicateSSAName {
                    function: self.name.clone(),
                    duplicate: name,
                })
            }
        };

        for (name, _) in self.params.iter() {
            define(*name)?;
        }

        for bb in self.body.values() {
            for instr in &bb.instructions {
                if let Some(dest) = instr.destination() {
                    define(dest)?;
                }
            }
            if let Some(dest) = bb.terminator.destination() {
                define(dest)?;
            }
        }

        for (label, bb) in self.body.iter() {
            let mut seen_non_phi = false;
            for instr in &bb.instructions {
                if instr.is_phi() {
                    if seen_non_phi {
                        return Err(Error::PhiNotFirstInstruction {
                            function: self.name.clone(),
                            block: *label,
                        });
                    }
                } else {
                    seen_non_phi = true;
                }

                for name in instr.dependencies() {
                    if !defined_names.contains(&name) {
                        return Err(Error::UndefinedSSAName {
                            function: self.name.clone(),
                            undefined: name,
                        });
                    }
                }
            }

            for name in bb.terminator.dependencies() {
                if !defined_names.contains(&name) {
                    return Err(Error::UndefinedSSAName {
                        function: self.name.clone(),
                        undefined: name,
                    });
                }
            }

            for target in bb.terminator.iter_targets() {
                if !self.body.contains_key(&target) {
                    return Err(Error::UndefinedBasicBlock {
                        function: self.name.clone(),
                        label: target,
                    });
                }
            }
        }

        Ok(())
    }

    /// Verify that debug records describe the code they are attached to:
    /// every `locals` entry names an `alloca` result, and variables are named.
    pub fn check_debug_info(&self) -> Result<(), Error> {
        let allocas: BTreeSet<Name> = self
            .instructions()
            .filter_map(|instr| match instr {
                Instr::MAlloca(alloca) => Some(alloca.dest),
                _ => None,
            })
            .collect();

        for (name, var) in self.locals.iter() {
            if !allocas.contains(name) {
                return Err(Error::InconsistentDebugInfo {
                    symbol: self.name.clone(),
                    reason: format!(
                        "local variable `{}` is attached to `{}`, which is not a stack allocation",
                        var.name, name
                    ),
                });
            }
            if var.name.is_empty() {
                return Err(Error::InconsistentDebugInfo {
                    symbol: self.name.clone(),
                    reason: format!("the local variable attached to `{}` has no name", name),
                });
            }
        }

        Ok(())
    }

    /// Type of every SSA name defined by the function (parameters and
    /// instruction results).
    pub fn value_types(&self, registry: &TypeRegistry) -> BTreeMap<Name, Typeref> {
        let mut types: BTreeMap<Name, Typeref> = self.params.iter().copied().collect();
        for bb in self.body.values() {
            for instr in &bb.instructions {
                if let (Some(dest), Some(ty)) =
                    (instr.destination(), instr.destination_type(registry))
                {
                    types.insert(dest, ty);
                }
            }
            if let (Some(dest), Some(ty)) = (
                bb.terminator.destination(),
                bb.terminator.destination_type(),
            ) {
                types.insert(dest, ty);
            }
        }
        types
    }

    /// Successor labels of `label`, deduplicated.
    pub fn successors(&self, label: Label) -> BTreeSet<Label> {
        self.body
            .get(&label)
            .map(|bb| bb.terminator.iter_targets().collect())
            .unwrap_or_default()
    }

    fn undefined_block(&self, label: Label) -> Error {
        Error::UndefinedBasicBlock {
            function: self.name.clone(),
            label,
        }
    }

    /// Split every edge `from -> to` with a new block that jumps to `to`.
    ///
    /// Terminators of `from` are retargeted and phi nodes in `to` see the new
    /// block as their predecessor. Returns the label of the new block.
    pub fn split_edge(&mut self, from: Label, to: Label) -> Result<Label, Error> {
        let source = self.body.get(&from).ok_or_else(|| self.undefined_block(from))?;
        if !self.body.contains_key(&to) {
            return Err(self.undefined_block(to));
        }
        if !source.terminator.iter_targets().any(|target| target == to) {
            return Err(Error::UndefinedEdge {
                function: self.name.clone(),
                from,
                to,
            });
        }

        let middle = self.insert_block(BasicBlock::new(Jump { target: to }));
        if let Some(source) = self.body.get_mut(&from) {
            source.terminator.retarget(to, middle);
        }
        if let Some(target) = self.body.get_mut(&to) {
            target.relabel_phis(from, middle);
        }

        trace!("{}: split edge {} -> {} with {}", self.name, from, to, middle);
        Ok(middle)
    }

    /// Move the terminator of `label` into a new, empty block and make
    /// `label` jump to it.
    ///
    /// The returned block holds the original terminator, so phi nodes of the
    /// successors are relabelled to it. The caller is free to replace the
    /// placeholder jump left in `label`.
    pub fn split_before_terminator(&mut self, label: Label) -> Result<Label, Error> {
        if !self.body.contains_key(&label) {
            return Err(self.undefined_block(label));
        }

        let tail = self.next_available_label();
        let terminator = match self.body.get_mut(&label) {
            Some(block) => std::mem::replace(&mut block.terminator, Jump { target: tail }.into()),
            None => return Err(self.undefined_block(label)),
        };

        let successors: BTreeSet<Label> = terminator.iter_targets().collect();
        self.body.insert(tail, BasicBlock::new(terminator));
        for successor in successors {
            if let Some(block) = self.body.get_mut(&successor) {
                block.relabel_phis(label, tail);
            }
        }

        trace!("{}: moved terminator of {} into {}", self.name, label, tail);
        Ok(tail)
    }
}

/// A module containing defined functions, declarations and globals.
///
/// `Module` acts as the compilation unit boundary for symbol visibility.
/// Functions defined here appear in `functions` in declaration order;
/// references to symbols not defined locally are listed in
/// `external_functions`. `constructors` names functions run before `main`.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub external_functions: Vec<ExternalFunction>,
    pub globals: Vec<GlobalVariable>,
    pub constructors: Vec<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Defined function named `name`.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|func| func.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|func| func.name == name)
    }

    /// Global variable named `name`.
    pub fn global(&self, name: &str) -> Option<&GlobalVariable> {
        self.globals.iter().find(|global| global.name == name)
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut GlobalVariable> {
        self.globals.iter_mut().find(|global| global.name == name)
    }

    /// External declaration named `name`.
    pub fn external_function(&self, name: &str) -> Option<&ExternalFunction> {
        self.external_functions.iter().find(|func| func.name == name)
    }

    /// Add `global` unless a global with the same name exists. Returns true
    /// if the global was added.
    pub fn declare_global(&mut self, global: GlobalVariable) -> bool {
        if self.global(&global.name).is_some() {
            return false;
        }
        self.globals.push(global);
        true
    }

    /// Declare an external function unless a function with the same name is
    /// already defined or declared. Returns true if the declaration was added.
    pub fn declare_external(&mut self, decl: ExternalFunction) -> bool {
        if self.function(&decl.name).is_some() || self.external_function(&decl.name).is_some() {
            return false;
        }
        self.external_functions.push(decl);
        true
    }

    /// Register `name` as a static constructor, once.
    pub fn add_constructor(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.constructors.contains(&name) {
            self.constructors.push(name);
        }
    }

    /// Return type of the function (defined or declared) named `name`.
    /// The outer option is `None` when the function is unknown.
    pub fn return_type_of(&self, name: &str) -> Option<Option<Typeref>> {
        self.function(name)
            .map(|func| func.return_type)
            .or_else(|| self.external_function(name).map(|decl| decl.return_type))
    }

    /// Run [`Function::check_ssa`] and [`Function::check_debug_info`] over
    /// every function, and validate the debug records of globals.
    pub fn check(&self) -> Result<(), Error> {
        for func in &self.functions {
            func.check_ssa()?;
            func.check_debug_info()?;
        }
        for global in &self.globals {
            if let Some(debug) = &global.debug {
                if debug.name.is_empty() {
                    return Err(Error::InconsistentDebugInfo {
                        symbol: global.name.clone(),
                        reason: "the debug record of the global has no name".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
