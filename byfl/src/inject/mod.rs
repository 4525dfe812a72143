//! Construction of the injected code.
//!
//! An [`Injector`] owns everything the pass adds to a module besides the
//! rewritten functions: the counter layout, the declarations of runtime
//! routines, and the constant strings and symbol records passed to the
//! runtime. Code sequences are built into plain `Vec<Instr>` buffers and
//! spliced by the caller.
pub mod guard;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use byinstr::{
    consts::AnyConst,
    modules::{
        Linkage, Module,
        instructions::Instr,
        int::{IAdd, ICmp, ICmpOp, IMul},
        mem::{MGetElementPtr, MLoad, MStore},
        misc::{Call, Cast, CastOp},
        operand::{Label, Name, Operand},
        symbol::GlobalVariable,
    },
    types::{TypeRegistry, Typeref},
};
use log::{debug, warn};
use smallvec::smallvec;
use strum::IntoEnumIterator;

use crate::{
    classify::BlockEnd,
    counters::{CounterArray, CounterClears, CounterSet, ScalarCounter},
    inject::guard::Guard,
    keys::FunctionKey,
    magic::Routine,
    symbols::{IdGenerator, Provenance},
};

/// Module-level items requested while instrumenting, added to the module
/// once every function is done.
#[derive(Debug, Default)]
pub struct Declarations {
    globals: Vec<GlobalVariable>,
    routines: BTreeSet<Routine>,
    strings: BTreeMap<String, String>,
    symbols: HashMap<Provenance, String>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference to `routine`, declaring it on first use.
    pub fn routine(&mut self, routine: Routine) -> Operand {
        self.routines.insert(routine);
        Operand::Function(routine.name().to_string())
    }

    /// Name of a private constant holding `text`. Equal strings share one
    /// global.
    pub fn string(&mut self, registry: &TypeRegistry, text: &str) -> String {
        if let Some(name) = self.strings.get(text) {
            return name.clone();
        }
        let name = format!("bf.str.{}", self.strings.len());
        let constant = AnyConst::Str(text.to_string());
        self.globals.push(
            GlobalVariable::new(
                name.clone(),
                constant.type_of(registry),
                constant,
                Linkage::Private,
            )
            .read_only(),
        );
        self.strings.insert(text.to_string(), name.clone());
        name
    }

    pub fn global(&mut self, global: GlobalVariable) {
        self.globals.push(global);
    }

    pub fn routines(&self) -> impl Iterator<Item = Routine> + '_ {
        self.routines.iter().copied()
    }

    /// Add every buffered item to `module`. Existing definitions win.
    pub fn apply(self, module: &mut Module, registry: &TypeRegistry) {
        for global in self.globals {
            let name = global.name.clone();
            if !module.declare_global(global) {
                warn!("global {} is already defined, keeping the existing definition", name);
            }
        }
        for routine in self.routines {
            if !module.declare_external(routine.declaration(registry)) {
                debug!("{} is already declared", routine.name());
            }
        }
    }
}

/// Type of the constant record describing a symbol:
/// `{ i64 id, ptr origin, ptr symbol, ptr function, ptr file, i32 line, i8 precise }`.
pub fn symbol_record_type(registry: &TypeRegistry) -> Typeref {
    let ptr = registry.ptr();
    registry.structure(vec![
        registry.int(64),
        ptr,
        ptr,
        ptr,
        ptr,
        registry.int(32),
        registry.int(8),
    ])
}

/// Builder of injected code for one module.
pub struct Injector<'r> {
    registry: &'r TypeRegistry,
    counters: CounterSet,
    guard: Guard,
    decls: Declarations,
    next_name: u32,
}

impl<'r> Injector<'r> {
    pub fn new(registry: &'r TypeRegistry, counters: CounterSet, guard: Guard) -> Self {
        Self {
            registry,
            counters,
            guard,
            decls: Declarations::new(),
            next_name: 0,
        }
    }

    pub fn counters(&self) -> &CounterSet {
        &self.counters
    }

    pub fn guard(&self) -> Guard {
        self.guard
    }

    pub fn declarations(&mut self) -> &mut Declarations {
        &mut self.decls
    }

    /// Start emitting into a function whose first unused name is `next`.
    pub fn begin_function(&mut self, next: Name) {
        self.next_name = next.0;
    }

    fn fresh(&mut self) -> Name {
        let name = Name(self.next_name);
        self.next_name += 1;
        name
    }

    fn i64_ty(&self) -> Typeref {
        self.registry.int(64)
    }

    /// Address of a private string constant.
    pub fn string(&mut self, text: &str) -> Operand {
        Operand::Global(self.decls.string(self.registry, text))
    }

    /// Address of the symbol record for `provenance`. Records are shared
    /// between equal provenances, so an id is drawn only once per object.
    pub fn symbol(&mut self, provenance: Provenance, ids: &mut dyn IdGenerator) -> Operand {
        if let Some(name) = self.decls.symbols.get(&provenance) {
            return Operand::Global(name.clone());
        }

        let name = format!("bf.syminfo.{}", self.decls.symbols.len());
        let info = provenance.clone().with_id(ids.next_id());
        let registry = self.registry;
        let fields = vec![
            AnyConst::i64(info.id),
            AnyConst::GlobalAddr(self.decls.string(registry, &info.origin)),
            AnyConst::GlobalAddr(self.decls.string(registry, &info.symbol)),
            AnyConst::GlobalAddr(self.decls.string(registry, &info.function)),
            AnyConst::GlobalAddr(self.decls.string(registry, &info.file)),
            AnyConst::i32(info.line),
            AnyConst::i8(info.precise as u8),
        ];
        let ty = symbol_record_type(self.registry);
        self.decls.global(
            GlobalVariable::new(
                name.clone(),
                ty,
                AnyConst::Struct { ty, fields },
                Linkage::Private,
            )
            .read_only(),
        );
        self.decls.symbols.insert(provenance, name.clone());
        Operand::Global(name)
    }

    /// Call `routine` with `args`.
    pub fn call(&mut self, code: &mut Vec<Instr>, routine: Routine, args: Vec<Operand>) {
        let function = self.decls.routine(routine);
        code.push(
            Call {
                dest: None,
                ty: None,
                function,
                args,
            }
            .into(),
        );
    }

    /// `*addr += amount` on an `i64` in memory.
    fn increment(&mut self, code: &mut Vec<Instr>, addr: Operand, amount: Operand) {
        let ty = self.i64_ty();
        let old = self.fresh();
        let new = self.fresh();
        code.push(
            MLoad {
                dest: old,
                ty,
                addr: addr.clone(),
                alignment: Some(8),
                volatile: false,
            }
            .into(),
        );
        code.push(
            IAdd {
                dest: new,
                ty,
                lhs: Operand::Reg(old),
                rhs: amount,
            }
            .into(),
        );
        code.push(
            MStore {
                addr,
                value: Operand::Reg(new),
                ty,
                alignment: Some(8),
                volatile: false,
            }
            .into(),
        );
    }

    pub fn add_scalar(&mut self, code: &mut Vec<Instr>, counter: ScalarCounter, amount: u64) {
        self.add_scalar_dynamic(code, counter, AnyConst::i64(amount).into());
    }

    pub fn add_scalar_dynamic(
        &mut self,
        code: &mut Vec<Instr>,
        counter: ScalarCounter,
        amount: Operand,
    ) {
        let addr = self.counters.scalar(counter);
        self.increment(code, addr, amount);
    }

    /// `array[index] += amount`.
    pub fn add_to_array(
        &mut self,
        code: &mut Vec<Instr>,
        array: CounterArray,
        index: usize,
        amount: Operand,
    ) {
        debug_assert!((index as u64) < array.len, "{} out of range", array.name);
        let slot = self.fresh();
        code.push(
            MGetElementPtr {
                dest: slot,
                ty: array.ty,
                base: array.operand(),
                indices: smallvec![AnyConst::i64(0).into(), AnyConst::i64(index as u64).into()],
            }
            .into(),
        );
        self.increment(code, Operand::Reg(slot), amount);
    }

    /// Increment one cell of the dependency histogram. Does nothing when the
    /// histogram is disabled.
    pub fn add_dependency(&mut self, code: &mut Vec<Instr>, cell: [usize; 4]) {
        let Some(histogram) = self.counters.inst_deps else {
            return;
        };
        let slot = self.fresh();
        let mut indices = smallvec![AnyConst::i64(0).into()];
        indices.extend(cell.iter().map(|index| AnyConst::i64(*index as u64).into()));
        code.push(
            MGetElementPtr {
                dest: slot,
                ty: histogram.ty,
                base: Operand::Global(histogram.name.to_string()),
                indices,
            }
            .into(),
        );
        self.increment(code, Operand::Reg(slot), AnyConst::i64(1).into());
    }

    fn zero_scalar(&mut self, code: &mut Vec<Instr>, counter: ScalarCounter) {
        code.push(
            MStore {
                addr: self.counters.scalar(counter),
                value: AnyConst::i64(0).into(),
                ty: self.i64_ty(),
                alignment: Some(8),
                volatile: false,
            }
            .into(),
        );
    }

    fn zero_array(&mut self, code: &mut Vec<Instr>, array: CounterArray) {
        self.call(
            code,
            Routine::Memset,
            vec![
                array.operand(),
                AnyConst::i8(0).into(),
                AnyConst::i64(array.byte_size()).into(),
                AnyConst::i1(false).into(),
            ],
        );
    }

    /// Hand the per-block counters to the runtime and zero the ones in
    /// `clears`.
    ///
    /// `key` attributes the counts to a function. `report` makes the runtime
    /// print the block's tallies right away.
    pub fn flush(
        &mut self,
        code: &mut Vec<Instr>,
        key: Option<FunctionKey>,
        end: BlockEnd,
        report: bool,
        clears: CounterClears,
    ) {
        if let Some(key) = key {
            self.call(
                code,
                Routine::AssocCountersWithFunc,
                vec![AnyConst::i32(key.0).into()],
            );
        }
        self.call(
            code,
            Routine::AccumulateBbTallies,
            vec![AnyConst::i64(end.code()).into()],
        );
        if report {
            self.call(code, Routine::ReportBbTallies, vec![]);
            self.call(code, Routine::ResetBbTallies, vec![]);
        }

        let clears = clears & self.counters.resettable();
        for counter in ScalarCounter::iter() {
            if clears.contains(counter.clear_flag()) {
                self.zero_scalar(code, counter);
            }
        }
        if clears.contains(CounterClears::MEM_TYPES) {
            let mem_types = self.counters.mem_types;
            self.zero_array(code, mem_types);
        }
    }

    /// `value` widened or narrowed to `i64`.
    pub fn to_i64(&mut self, code: &mut Vec<Instr>, value: &Operand, ty: Typeref) -> Operand {
        let i64_ty = self.i64_ty();
        if ty == i64_ty {
            return value.clone();
        }
        if let Operand::Imm(constant) = value {
            if let Some(value) = constant.as_u64() {
                return AnyConst::i64(value).into();
            }
        }

        let op = if self.registry.primitive_bits(ty) > 64 {
            CastOp::Trunc
        } else {
            CastOp::ZExt
        };
        let dest = self.fresh();
        code.push(
            Cast {
                dest,
                op,
                from_ty: ty,
                to_ty: i64_ty,
                value: value.clone(),
            }
            .into(),
        );
        Operand::Reg(dest)
    }

    /// `lhs * rhs` on `i64`, folded when both are immediates.
    pub fn mul_i64(&mut self, code: &mut Vec<Instr>, lhs: Operand, rhs: Operand) -> Operand {
        if let (Operand::Imm(a), Operand::Imm(b)) = (&lhs, &rhs) {
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return AnyConst::i64(a.wrapping_mul(b)).into();
            }
        }
        let dest = self.fresh();
        code.push(
            IMul {
                dest,
                ty: self.i64_ty(),
                lhs,
                rhs,
            }
            .into(),
        );
        Operand::Reg(dest)
    }

    /// Count one more block towards the merged flush. Returns the condition
    /// that is true once `threshold` blocks have been counted.
    pub fn count_merged_block(&mut self, code: &mut Vec<Instr>, threshold: u64) -> Option<Operand> {
        let name = self.counters.merge_count?;
        let ty = self.i64_ty();
        let addr = Operand::Global(name.to_string());
        let old = self.fresh();
        let new = self.fresh();
        let cond = self.fresh();
        code.push(
            MLoad {
                dest: old,
                ty,
                addr: addr.clone(),
                alignment: Some(8),
                volatile: false,
            }
            .into(),
        );
        code.push(
            IAdd {
                dest: new,
                ty,
                lhs: Operand::Reg(old),
                rhs: AnyConst::i64(1).into(),
            }
            .into(),
        );
        code.push(
            MStore {
                addr,
                value: Operand::Reg(new),
                ty,
                alignment: Some(8),
                volatile: false,
            }
            .into(),
        );
        code.push(
            ICmp {
                dest: cond,
                ty,
                lhs: Operand::Reg(new),
                rhs: AnyConst::i64(threshold).into(),
                op: ICmpOp::Uge,
            }
            .into(),
        );
        Some(Operand::Reg(cond))
    }

    /// Zero the merge counter.
    pub fn reset_merge_count(&mut self, code: &mut Vec<Instr>) {
        if let Some(name) = self.counters.merge_count {
            code.push(
                MStore {
                    addr: Operand::Global(name.to_string()),
                    value: AnyConst::i64(0).into(),
                    ty: self.i64_ty(),
                    alignment: Some(8),
                    volatile: false,
                }
                .into(),
            );
        }
    }

    /// `code` bracketed by the lock when thread safety is requested.
    pub fn guarded(&mut self, code: Vec<Instr>) -> Vec<Instr> {
        self.guard.wrap(code, &mut self.decls)
    }

    pub fn finish(self) -> Declarations {
        self.decls
    }
}

/// Rendered text of instructions, memoized per `(block, index)` and used to
/// tag vector operations.
#[derive(Debug, Default)]
pub struct InstructionStrings {
    rendered: BTreeMap<(Label, usize), Operand>,
}

impl InstructionStrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(
        &mut self,
        injector: &mut Injector,
        label: Label,
        index: usize,
        text: impl FnOnce() -> String,
    ) -> Operand {
        self.rendered
            .entry((label, index))
            .or_insert_with(|| injector.string(&text()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use byinstr::modules::Instruction;

    use crate::{symbols::SequentialIds, utils::conf::InstrumentOptions};

    use super::*;

    fn injector<'a>(registry: &'a TypeRegistry, options: &InstrumentOptions) -> Injector<'a> {
        Injector::new(
            registry,
            CounterSet::new(registry, options),
            Guard::new(options.thread_safe),
        )
    }

    #[test]
    fn increments_use_fresh_names() {
        let registry = TypeRegistry::new();
        let mut inj = injector(&registry, &InstrumentOptions::default());
        inj.begin_function(Name(10));

        let terminators = inj.counters().terminators;
        let mut code = vec![];
        inj.add_scalar(&mut code, ScalarCounter::Loads, 8);
        inj.add_to_array(&mut code, terminators, 1, AnyConst::i64(1).into());

        let defined: Vec<Name> = code.iter().filter_map(|instr| instr.destination()).collect();
        assert_eq!(defined, vec![Name(10), Name(11), Name(12), Name(13), Name(14)]);
        assert!(matches!(&code[2], Instr::MStore(store) if store.addr == Operand::Global("bf_load_count".to_string())));
        assert!(matches!(&code[3], Instr::MGetElementPtr(gep) if gep.indices.len() == 2));
    }

    #[test]
    fn flush_zeroes_only_requested_counters() {
        let registry = TypeRegistry::new();
        let mut inj = injector(&registry, &InstrumentOptions::default());
        let mut code = vec![];
        inj.flush(
            &mut code,
            Some(FunctionKey(3)),
            BlockEnd::Conditional,
            false,
            CounterClears::LOADS | CounterClears::MEM_TYPES,
        );

        let calls: Vec<&str> = code
            .iter()
            .filter_map(|instr| match instr {
                Instr::Call(call) => call.callee(),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["bf_assoc_counters_with_func", "bf_accumulate_bb_tallies"]);

        let stores = code
            .iter()
            .filter(|instr| matches!(instr, Instr::MStore(_)))
            .count();
        assert_eq!(stores, 1, "types are off, so the memory-type array stays");
    }

    #[test]
    fn strings_and_symbols_are_shared() {
        let registry = TypeRegistry::new();
        let mut inj = injector(&registry, &InstrumentOptions::default());
        let mut ids = SequentialIds::default();

        let a = inj.string("main");
        let b = inj.string("main");
        assert_eq!(a, b);

        let prov = Provenance {
            origin: "malloc".to_string(),
            symbol: "buf".to_string(),
            function: "main".to_string(),
            file: "a.c".to_string(),
            line: 4,
            precise: true,
        };
        let first = inj.symbol(prov.clone(), &mut ids);
        let second = inj.symbol(prov, &mut ids);
        assert_eq!(first, second);
        assert_eq!(ids.next_id(), 2, "only one id was drawn");

        let mut module = Module::new("m");
        inj.finish().apply(&mut module, &registry);
        let record = module.global("bf.syminfo.0").unwrap();
        assert!(record.constant);
        assert_eq!(record.linkage, Linkage::Private);
        let text = module.global("bf.str.0").unwrap();
        assert_eq!(registry.byte_size(text.ty), Some(5));
    }

    #[test]
    fn widening_folds_immediates() {
        let registry = TypeRegistry::new();
        let mut inj = injector(&registry, &InstrumentOptions::default());
        let mut code = vec![];

        let folded = inj.to_i64(&mut code, &AnyConst::i32(7).into(), registry.int(32));
        assert_eq!(folded, Operand::from(AnyConst::i64(7)));
        assert!(code.is_empty());

        let widened = inj.to_i64(&mut code, &Operand::Reg(Name(0)), registry.int(32));
        assert!(matches!(widened, Operand::Reg(_)));
        assert!(matches!(&code[0], Instr::Cast(cast) if cast.op == CastOp::ZExt));

        let product = inj.mul_i64(&mut code, AnyConst::i64(3).into(), AnyConst::i64(5).into());
        assert_eq!(product, Operand::from(AnyConst::i64(15)));
    }
}
