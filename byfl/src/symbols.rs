//! Symbol provenance.
//!
//! Data-structure tallies and stride tracking need to know which source
//! object an address belongs to. A [`ProvenanceResolver`] answers that from
//! whatever debug records are available; ids come from an [`IdGenerator`]
//! so that runs can be reproduced by fixing the seed.
use std::collections::BTreeSet;

use byinstr::modules::{
    Function, Instruction, Module,
    instructions::Instr,
    operand::{Name, Operand},
    symbol::GlobalVariable,
};
use log::debug;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// File reported when no debug record names one.
pub const UNKNOWN_FILE: &str = "??";

/// Function reported for module-level objects.
pub const NO_FUNCTION: &str = "*GLOBAL*";

/// Where a symbol comes from, without its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provenance {
    /// What created the object (`alloca`, `malloc`, `global`, ...).
    pub origin: String,
    pub symbol: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    /// Every field above came from a debug record.
    pub precise: bool,
}

impl Provenance {
    pub fn with_id(self, id: u64) -> SymbolInfo {
        SymbolInfo {
            id,
            origin: self.origin,
            symbol: self.symbol,
            function: self.function,
            file: self.file,
            line: self.line,
            precise: self.precise,
        }
    }
}

/// Description of a program object, emitted as a constant record the runtime
/// receives by address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolInfo {
    pub id: u64,
    pub origin: String,
    pub symbol: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub precise: bool,
}

/// Source of symbol ids. Ids are unique within one compilation.
pub trait IdGenerator {
    fn next_id(&mut self) -> u64;
}

/// Pseudo-random ids from a ChaCha stream seeded once per compilation.
pub struct SeededIds {
    rng: ChaCha20Rng,
    issued: BTreeSet<u64>,
}

impl SeededIds {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            issued: BTreeSet::new(),
        }
    }
}

impl IdGenerator for SeededIds {
    fn next_id(&mut self) -> u64 {
        loop {
            let id = self.rng.next_u64();
            // Zero is reserved for "no symbol" on the runtime side.
            if id != 0 && self.issued.insert(id) {
                return id;
            }
        }
    }
}

/// Ids `1, 2, 3, ...`.
#[derive(Debug, Default)]
pub struct SequentialIds(u64);

impl IdGenerator for SequentialIds {
    fn next_id(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Maps program objects to their source-level description.
pub trait ProvenanceResolver {
    /// Provenance of the object `value` points into, as seen from `function`.
    fn resolve_value(
        &self,
        module: &Module,
        function: &Function,
        value: &Operand,
        origin: &str,
    ) -> Provenance;

    fn resolve_function(&self, function: &Function) -> Provenance;

    fn resolve_global(&self, global: &GlobalVariable) -> Provenance;
}

/// Resolver reading the debug records carried by the IR.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugInfoResolver;

/// Instruction of `function` defining `name`, if any.
pub fn definition(function: &Function, name: Name) -> Option<&Instr> {
    function
        .instructions()
        .find(|instr| instr.destination() == Some(name))
}

/// Follow `gep` and `cast` chains from `value` back to the object it is
/// derived from.
pub fn base_object<'a>(function: &'a Function, value: &'a Operand) -> &'a Operand {
    let mut current = value;
    let mut budget = function.instructions().count();
    while let Operand::Reg(name) = current {
        if budget == 0 {
            break;
        }
        budget -= 1;
        current = match definition(function, *name) {
            Some(Instr::MGetElementPtr(gep)) => &gep.base,
            Some(Instr::Cast(cast)) => &cast.value,
            _ => break,
        };
    }
    current
}

impl DebugInfoResolver {
    fn fallback(function: &Function, symbol: String, origin: &str) -> Provenance {
        let (file, line) = match &function.source {
            Some(loc) => (loc.file.clone(), loc.line),
            None => (UNKNOWN_FILE.to_string(), 0),
        };
        Provenance {
            origin: origin.to_string(),
            symbol,
            function: function.name.clone(),
            file,
            line,
            precise: false,
        }
    }
}

impl ProvenanceResolver for DebugInfoResolver {
    fn resolve_value(
        &self,
        module: &Module,
        function: &Function,
        value: &Operand,
        origin: &str,
    ) -> Provenance {
        let provenance = match base_object(function, value) {
            Operand::Global(name) => match module.global(name) {
                Some(global) => Provenance {
                    origin: origin.to_string(),
                    ..self.resolve_global(global)
                },
                None => Self::fallback(function, name.clone(), origin),
            },
            Operand::Reg(name) => {
                if let Some(var) = function.locals.get(name) {
                    Provenance {
                        origin: origin.to_string(),
                        symbol: var.name.clone(),
                        function: function.name.clone(),
                        file: var.file.clone(),
                        line: var.line,
                        precise: true,
                    }
                } else if let Some(loc) = function.locations.get(name) {
                    Provenance {
                        file: loc.file.clone(),
                        line: loc.line,
                        ..Self::fallback(function, name.to_string(), origin)
                    }
                } else {
                    Self::fallback(function, name.to_string(), origin)
                }
            }
            other => Self::fallback(function, other.to_string(), origin),
        };

        if !provenance.precise {
            debug!(
                "imprecise provenance for {} in {}: {}:{}",
                value, function.name, provenance.file, provenance.line
            );
        }
        provenance
    }

    fn resolve_function(&self, function: &Function) -> Provenance {
        match &function.source {
            Some(loc) => Provenance {
                origin: "function".to_string(),
                symbol: function.name.clone(),
                function: function.name.clone(),
                file: loc.file.clone(),
                line: loc.line,
                precise: true,
            },
            None => Self::fallback(function, function.name.clone(), "function"),
        }
    }

    fn resolve_global(&self, global: &GlobalVariable) -> Provenance {
        match &global.debug {
            Some(var) => Provenance {
                origin: "global".to_string(),
                symbol: var.name.clone(),
                function: NO_FUNCTION.to_string(),
                file: var.file.clone(),
                line: var.line,
                precise: true,
            },
            None => {
                debug!("no debug record for global {}", global.name);
                Provenance {
                    origin: "global".to_string(),
                    symbol: global.name.clone(),
                    function: NO_FUNCTION.to_string(),
                    file: UNKNOWN_FILE.to_string(),
                    line: 0,
                    precise: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use byinstr::{
        builder::FunctionBuilder,
        consts::AnyConst,
        modules::{DebugVariable, Linkage},
        types::TypeRegistry,
    };

    use super::*;

    #[test]
    fn seeded_ids_are_reproducible_and_unique() {
        let mut a = SeededIds::new(42);
        let mut b = SeededIds::new(42);
        let first: Vec<u64> = (0..64).map(|_| a.next_id()).collect();
        let second: Vec<u64> = (0..64).map(|_| b.next_id()).collect();
        assert_eq!(first, second);

        let unique: BTreeSet<u64> = first.iter().copied().collect();
        assert_eq!(unique.len(), first.len());
        assert!(!unique.contains(&0));
    }

    #[test]
    fn locals_resolve_through_gep_chains() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let arr = reg.array(i64_ty, 8);
        let mut b = FunctionBuilder::new(&reg, "f", &[], None);
        b.set_source("f.c", 1);
        let (slot, slot_name) = b.alloca(arr);
        b.describe_local(
            slot_name,
            DebugVariable {
                name: "buffer".to_string(),
                file: "f.c".to_string(),
                line: 3,
            },
        );
        let elem = b.gep(
            arr,
            slot,
            vec![AnyConst::i64(0).into(), AnyConst::i64(2).into()],
        );
        b.store(i64_ty, AnyConst::i64(1).into(), elem.clone());
        b.ret(None);
        let func = b.finish();

        let module = Module::new("m");
        let prov = DebugInfoResolver.resolve_value(&module, &func, &elem, "alloca");
        assert!(prov.precise);
        assert_eq!(prov.symbol, "buffer");
        assert_eq!((prov.file.as_str(), prov.line), ("f.c", 3));
        assert_eq!(prov.function, "f");
    }

    #[test]
    fn missing_records_fall_back_imprecisely() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let mut module = Module::new("m");
        module.globals.push(GlobalVariable::new(
            "table",
            i64_ty,
            AnyConst::i64(0),
            Linkage::Internal,
        ));

        let mut b = FunctionBuilder::new(&reg, "g", &[reg.ptr()], None);
        let p = b.param(0);
        b.ret(None);
        let func = b.finish();

        let prov = DebugInfoResolver.resolve_value(&module, &func, &p, "load");
        assert!(!prov.precise);
        assert_eq!(prov.file, UNKNOWN_FILE);
        assert_eq!(prov.symbol, "%0");

        let global = DebugInfoResolver.resolve_value(
            &module,
            &func,
            &Operand::Global("table".to_string()),
            "store",
        );
        assert_eq!(global.origin, "store");
        assert_eq!(global.function, NO_FUNCTION);
        assert!(!global.precise);

        let func_prov = DebugInfoResolver.resolve_function(&func);
        assert_eq!(func_prov.symbol, "g");
        assert!(!func_prov.precise);
    }
}
