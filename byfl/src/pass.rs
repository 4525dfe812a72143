//! The instrumentation pass.
//!
//! Functions are visited in declaration order and their blocks in label
//! order. Every decision is taken on a snapshot of the function as it was
//! before instrumentation, so instruction indices and types stay valid while
//! code is spliced into the live copy.
use std::collections::BTreeMap;

use byinstr::{
    builder::FunctionBuilder,
    cfg::ControlFlowGraph,
    consts::AnyConst,
    modules::{
        BasicBlock, Function, InsertionPoint, Instruction, Linkage, Module,
        instructions::Instr,
        mem::MAlloca,
        misc::Call,
        operand::{Label, Name, Operand},
        symbol::GlobalVariable,
        terminator::{CBranch, Jump, Terminator},
    },
    types::{TypeRegistry, Typeref},
    utils::Error,
};
use log::{debug, info, trace, warn};

use crate::{
    classify::{
        Allocator, BlockEnd, Classification, InstKind, MemIntrinsic, NUM_OPCODES, TypeContext,
        allocator, classify, classify_terminator, is_constant_address, is_ignorable_call,
        memory_intrinsic, opcode_names, terminator_index, vector_operation,
    },
    counters::{
        CounterClears, CounterSet, DEP_PRODUCER_ARGUMENT, DEP_PRODUCER_CONSTANT, DepType,
        MemIntrinsicTally, ScalarCounter, TerminatorTally, mem_type_index,
    },
    filter::FunctionFilter,
    inject::{InstructionStrings, Injector, guard::Guard},
    keys::{FunctionKey, FunctionKeyRegistry},
    loops::{InnerLoopInfo, instrument_inner_loops, loop_key},
    magic::{self, Routine, is_runtime_symbol},
    summary::InstrumentationSummary,
    symbols::{IdGenerator, ProvenanceResolver, SeededIds},
    utils::{
        conf::{InstrumentOptions, ReuseDistance},
        error::ByflResult,
    },
};

/// Instrument every eligible function of `module`.
///
/// The module is only replaced when the whole pass succeeds. Symbol ids are
/// drawn from a ChaCha stream seeded by [`InstrumentOptions::seed_for`].
pub fn instrument_module(
    module: &mut Module,
    registry: &TypeRegistry,
    options: &InstrumentOptions,
    resolver: &dyn ProvenanceResolver,
) -> ByflResult<InstrumentationSummary> {
    let mut ids = SeededIds::new(options.seed_for(&module.name));
    instrument_module_with_ids(module, registry, options, resolver, &mut ids)
}

/// [`instrument_module`] with a caller-provided id source.
pub fn instrument_module_with_ids(
    module: &mut Module,
    registry: &TypeRegistry,
    options: &InstrumentOptions,
    resolver: &dyn ProvenanceResolver,
    ids: &mut dyn IdGenerator,
) -> ByflResult<InstrumentationSummary> {
    options.validate()?;

    let mut working = module.clone();
    let summary =
        Instrumenter::new(registry, options, resolver, ids, &working.name).run(&mut working)?;
    *module = working;

    info!("{}", summary.to_string().trim_end());
    Ok(summary)
}

/// Code generated for one call site.
#[derive(Default)]
struct CallCode {
    /// Runs before the call.
    pre: Vec<Instr>,
    /// Counter updates. They only read the call operands.
    counts: Vec<Instr>,
    /// Needs the call result.
    post: Vec<Instr>,
}

/// Pending splice into a block. Edits are applied from the bottom of the
/// block up so that earlier indices stay valid.
struct Edit {
    position: usize,
    rank: u8,
    point: InsertionPoint,
    code: Vec<Instr>,
}

impl Edit {
    fn after(index: usize, code: Vec<Instr>) -> Self {
        Self {
            position: index + 1,
            rank: 0,
            point: InsertionPoint::After(index),
            code,
        }
    }

    /// Code following the leading phis of a block.
    fn after_phis(phis: usize, code: Vec<Instr>) -> Self {
        Self {
            position: phis,
            rank: 1,
            point: InsertionPoint::Before(phis),
            code,
        }
    }

    fn before(index: usize, code: Vec<Instr>) -> Self {
        Self {
            position: index,
            rank: 2,
            point: InsertionPoint::Before(index),
            code,
        }
    }
}

/// What the pass knows about the function being instrumented.
struct FunctionScope<'f> {
    original: &'f Function,
    types: TypeContext<'f>,
    key: FunctionKey,
    /// Histogram row and type of every instruction result.
    producers: BTreeMap<Name, (usize, DepType)>,
    strings: InstructionStrings,
}

fn producers(function: &Function, registry: &TypeRegistry) -> BTreeMap<Name, (usize, DepType)> {
    let mut producers = BTreeMap::new();
    for block in function.body.values() {
        for instr in &block.instructions {
            if let Some(dest) = instr.destination() {
                let ty = DepType::of(registry, instr.destination_type(registry));
                producers.insert(dest, (instr.opcode().index(), ty));
            }
        }
        if let Some(dest) = block.terminator.destination() {
            let ty = DepType::of(registry, block.terminator.destination_type());
            producers.insert(dest, (terminator_index(block.terminator.kind()), ty));
        }
    }
    producers
}

fn block_mut(function: &mut Function, label: Label) -> Result<&mut BasicBlock, Error> {
    function
        .body
        .get_mut(&label)
        .ok_or_else(|| Error::UndefinedBasicBlock {
            function: function.name.clone(),
            label,
        })
}

fn check_globals(module: &Module) -> Result<(), Error> {
    for global in &module.globals {
        if global.debug.as_ref().is_some_and(|debug| debug.name.is_empty()) {
            return Err(Error::InconsistentDebugInfo {
                symbol: global.name.clone(),
                reason: "the debug record of the global has no name".to_string(),
            });
        }
    }
    Ok(())
}

struct Instrumenter<'a, 'i> {
    registry: &'a TypeRegistry,
    options: &'a InstrumentOptions,
    resolver: &'a dyn ProvenanceResolver,
    ids: &'i mut dyn IdGenerator,
    filter: FunctionFilter,
    keys: FunctionKeyRegistry,
    injector: Injector<'a>,
    summary: InstrumentationSummary,
}

impl<'a, 'i> Instrumenter<'a, 'i> {
    fn new(
        registry: &'a TypeRegistry,
        options: &'a InstrumentOptions,
        resolver: &'a dyn ProvenanceResolver,
        ids: &'i mut dyn IdGenerator,
        module_name: &str,
    ) -> Self {
        Self {
            registry,
            options,
            resolver,
            ids,
            filter: FunctionFilter::from_options(options),
            keys: FunctionKeyRegistry::new(),
            injector: Injector::new(
                registry,
                CounterSet::new(registry, options),
                Guard::new(options.thread_safe),
            ),
            summary: InstrumentationSummary::new(module_name),
        }
    }

    fn run(mut self, module: &mut Module) -> ByflResult<InstrumentationSummary> {
        check_globals(module)?;

        for global in self.injector.counters().globals() {
            let name = global.name.clone();
            if !module.declare_global(global) {
                debug!("reusing existing counter {}", name);
            }
        }
        self.publish_options(module);

        let mut functions = std::mem::take(&mut module.functions);
        let mut outcome = Ok(());
        for function in functions.iter_mut() {
            outcome = self.instrument_function(module, function);
            if outcome.is_err() {
                break;
            }
        }
        module.functions = functions;
        outcome?;

        if self.options.data_structs {
            self.emit_track_globals(module)?;
        }
        self.emit_key_table(module);
        if self.options.inst_mix || self.options.inst_deps {
            self.emit_opcode_names();
        }

        self.injector.finish().apply(module, self.registry);
        Ok(self.summary)
    }

    /// Define the link-once constants the runtime reads its configuration from.
    fn publish_options(&mut self, module: &mut Module) {
        let options = self.options;
        let constants = [
            (magic::OPT_EVERY_BB, AnyConst::i1(options.every_bb)),
            (magic::OPT_BB_MERGE, AnyConst::i64(options.merge_bb)),
            (magic::OPT_TYPES, AnyConst::i1(options.types)),
            (magic::OPT_INST_MIX, AnyConst::i1(options.inst_mix)),
            (magic::OPT_INST_DEPS, AnyConst::i1(options.inst_deps)),
            (magic::OPT_PER_FUNC, AnyConst::i1(options.tally_by_function())),
            (magic::OPT_CALL_STACK, AnyConst::i1(options.call_stack)),
            (magic::OPT_UNIQUE_BYTES, AnyConst::i1(options.unique_bytes)),
            (magic::OPT_MEM_FOOTPRINT, AnyConst::i1(options.mem_footprint)),
            (magic::OPT_DATA_STRUCTS, AnyConst::i1(options.data_structs)),
            (magic::OPT_VECTORS, AnyConst::i1(options.vectors)),
            (
                magic::OPT_REUSE_DIST,
                AnyConst::i64(options.reuse_distance_flags().bits()),
            ),
            (
                magic::OPT_MAX_REUSE_DIST,
                AnyConst::i64(options.max_reuse_distance.unwrap_or(u64::MAX)),
            ),
            (magic::OPT_CACHE_MODEL, AnyConst::i1(options.cache_model)),
            (magic::OPT_LINE_SIZE, AnyConst::i64(options.cache_line_bytes)),
            (
                magic::OPT_MAX_SET_BITS,
                AnyConst::i64(options.cache_max_set_bits),
            ),
            (magic::OPT_STRIDES, AnyConst::i1(options.strides)),
            (magic::OPT_THREAD_SAFE, AnyConst::i1(options.thread_safe)),
            (magic::OPT_OPTION_STRING, AnyConst::Str(options.describe())),
        ];

        for (name, value) in constants {
            let ty = value.type_of(self.registry);
            let global = GlobalVariable::new(name, ty, value, Linkage::LinkOnce).read_only();
            if !module.declare_global(global) {
                debug!("reusing existing option constant {}", name);
            }
        }
    }

    fn instrument_function(&mut self, module: &Module, function: &mut Function) -> ByflResult<()> {
        if is_runtime_symbol(&function.name) {
            trace!("{} belongs to the runtime", function.name);
            return Ok(());
        }
        if !self.filter.should_instrument(&function.name) {
            debug!("{} is filtered out", function.name);
            self.summary.skipped_functions += 1;
            return Ok(());
        }

        function.check_ssa()?;
        function.check_debug_info()?;

        let key = self.keys.key_for(&function.name);
        let original = function.clone();
        let values = original.value_types(self.registry);

        let cfg = ControlFlowGraph::new(&original);
        let inner = cfg.inner_loops();
        for lp in &inner {
            self.summary.inner_loops.insert(
                loop_key(&original.name, lp.header),
                InnerLoopInfo::measure(&original, lp),
            );
        }

        self.injector.begin_function(original.next_available_name());
        if self.options.inner_loops {
            instrument_inner_loops(function, &cfg, &inner, &mut self.injector)?;
        }

        let mut scope = FunctionScope {
            original: &original,
            types: TypeContext::new(self.registry, &values, &original.name),
            key,
            producers: producers(&original, self.registry),
            strings: InstructionStrings::new(),
        };
        for label in original.body.keys() {
            self.instrument_block(module, &mut scope, function, *label)?;
        }
        self.insert_entry_code(function, key)?;

        self.summary.instrumented_functions += 1;
        self.summary.static_blocks += original.body.len() as u64;
        debug!(
            "instrumented {} (key {}): {} blocks, {} inner loops",
            original.name,
            key,
            original.body.len(),
            inner.len()
        );
        Ok(())
    }

    fn count_static(&mut self, cls: &Classification) {
        match cls.kind {
            InstKind::Load => self.summary.static_loads += 1,
            InstKind::Store => self.summary.static_stores += 1,
            _ => {}
        }
        if cls.is_fp {
            self.summary.static_flops += 1;
        }
        if !cls.is_no_op {
            self.summary.static_ops += 1;
        }
    }

    fn instrument_block(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        function: &mut Function,
        label: Label,
    ) -> ByflResult<()> {
        let original = scope.original;
        let Some(block) = original.body.get(&label) else {
            return Ok(());
        };
        let registry = self.registry;

        let phis = block.phis().count();
        let mut edits = Vec::new();
        let mut phi_code = Vec::new();
        let mut clears = CounterClears::empty();

        for (index, instr) in block.instructions.iter().enumerate() {
            let cls = classify(instr, &scope.types)?;
            self.count_static(&cls);

            let mut pre = Vec::new();
            let mut post = Vec::new();
            match instr {
                Instr::MLoad(load) => {
                    self.instrument_access(module, scope, &load.addr, load.ty, false, &mut post, &mut clears)?
                }
                Instr::MStore(store) => {
                    self.instrument_access(module, scope, &store.addr, store.ty, true, &mut post, &mut clears)?
                }
                Instr::Call(call) => {
                    let code = self.instrument_call(module, scope, call, false, &mut clears)?;
                    pre = code.pre;
                    post = code.counts;
                    post.extend(code.post);
                }
                Instr::MAlloca(alloca) => self.instrument_alloca(module, scope, alloca, &mut post)?,
                _ => {}
            }

            let operands: Vec<&Operand> = instr.operands().collect();
            self.count_operation(
                scope,
                &cls,
                instr.opcode().index(),
                &operands,
                instr.destination_type(registry),
                (label, index),
                || instr.fmt(registry).to_string(),
                &mut post,
                &mut clears,
            )?;

            if !pre.is_empty() {
                edits.push(Edit::before(index, self.injector.guarded(pre)));
            }
            if matches!(instr, Instr::Phi(_)) {
                phi_code.extend(post);
            } else if !post.is_empty() {
                edits.push(Edit::after(index, self.injector.guarded(post)));
            }
        }
        if !phi_code.is_empty() {
            edits.push(Edit::after_phis(phis, self.injector.guarded(phi_code)));
        }

        edits.sort_by(|a, b| (b.position, b.rank).cmp(&(a.position, a.rank)));
        let live = block_mut(function, label)?;
        for edit in edits {
            live.insert(edit.point, edit.code)?;
        }

        self.instrument_block_end(module, scope, function, label, block, &mut clears)
    }

    /// Terminator counts and the end-of-block bookkeeping.
    fn instrument_block_end(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        function: &mut Function,
        label: Label,
        block: &BasicBlock,
        clears: &mut CounterClears,
    ) -> ByflResult<()> {
        let terminator = &block.terminator;
        let cls = classify_terminator(terminator, &scope.types)?;
        self.count_static(&cls);
        if terminator.is_conditional() {
            self.summary.static_cond_brs += 1;
        }

        let mut end = Vec::new();
        let mut after_invoke = Vec::new();
        if let Terminator::Invoke(invoke) = terminator {
            let code = self.instrument_call(module, scope, &invoke.call, true, clears)?;
            end.extend(code.pre);
            end.extend(code.counts);
            after_invoke = code.post;
        }

        let operands: Vec<&Operand> = terminator.operands().collect();
        self.count_operation(
            scope,
            &cls,
            terminator_index(terminator.kind()),
            &operands,
            terminator.destination_type(),
            (label, block.instructions.len()),
            || terminator.to_string(),
            &mut end,
            clears,
        )?;

        let tally = self.injector.counters().terminators;
        let one: Operand = AnyConst::i64(1).into();
        let taken = if terminator.is_conditional() {
            TerminatorTally::Conditional
        } else {
            TerminatorTally::Unconditional
        };
        self.injector
            .add_to_array(&mut end, tally, TerminatorTally::Any as usize, one.clone());
        self.injector.add_to_array(&mut end, tally, taken as usize, one);

        let key = self.options.tally_by_function().then_some(scope.key);
        let end_kind = BlockEnd::of(terminator);
        let pops = self.options.call_stack && matches!(terminator, Terminator::Ret(_));

        let terminator_block =
            match self.injector.count_merged_block(&mut end, self.options.merge_bb) {
                Some(cond) => self.merge_block(function, label, end, cond, key, end_kind, pops)?,
                None => {
                    self.injector
                        .flush(&mut end, key, end_kind, self.options.every_bb, *clears);
                    if pops {
                        self.injector.call(&mut end, Routine::PopFunction, vec![]);
                    }
                    let end = self.injector.guarded(end);
                    block_mut(function, label)?.insert(InsertionPoint::BlockEnd, end)?;
                    label
                }
            };

        if !after_invoke.is_empty() {
            self.place_after_invoke(function, terminator_block, after_invoke)?;
        }
        Ok(())
    }

    /// Split `label` so that the bookkeeping only runs once every
    /// `merge_bb` blocks. Returns the block now holding the terminator.
    #[allow(clippy::too_many_arguments)]
    fn merge_block(
        &mut self,
        function: &mut Function,
        label: Label,
        counted: Vec<Instr>,
        cond: Operand,
        key: Option<FunctionKey>,
        end_kind: BlockEnd,
        pops: bool,
    ) -> ByflResult<Label> {
        let guard = self.injector.guard();

        let mut head = Vec::with_capacity(counted.len() + 1);
        head.extend(guard.acquire(self.injector.declarations()));
        head.extend(counted);

        let mut flush = Vec::new();
        let clears = self.injector.counters().resettable();
        self.injector
            .flush(&mut flush, key, end_kind, self.options.every_bb, clears);
        self.injector.reset_merge_count(&mut flush);

        let mut tail_head = Vec::new();
        if pops {
            self.injector.call(&mut tail_head, Routine::PopFunction, vec![]);
        }
        tail_head.extend(guard.release(self.injector.declarations()));

        let tail = function.split_before_terminator(label)?;
        let flush_block = function.insert_block(BasicBlock {
            instructions: flush,
            terminator: Jump { target: tail }.into(),
        });

        let block = block_mut(function, label)?;
        block.insert(InsertionPoint::BlockEnd, head)?;
        block.terminator = CBranch {
            cond,
            target_true: flush_block,
            target_false: tail,
        }
        .into();
        block_mut(function, tail)?.insert(InsertionPoint::Before(0), tail_head)?;

        trace!(
            "{}: merged flush of {} in {}, terminator moved to {}",
            function.name, label, flush_block, tail
        );
        Ok(tail)
    }

    /// Code that needs the result of the invoke ending `label` runs on the
    /// normal edge.
    fn place_after_invoke(
        &mut self,
        function: &mut Function,
        label: Label,
        code: Vec<Instr>,
    ) -> ByflResult<()> {
        let (normal, unwind) = match &block_mut(function, label)?.terminator {
            Terminator::Invoke(invoke) => (invoke.normal, invoke.unwind),
            _ => return Ok(()),
        };
        if normal == unwind {
            warn!(
                "{}: invoke in {} unwinds to its normal destination, dropping its post-call code",
                function.name, label
            );
            return Ok(());
        }

        let middle = function.split_edge(label, normal)?;
        let code = self.injector.guarded(code);
        block_mut(function, middle)?.insert(InsertionPoint::Before(0), code)?;
        Ok(())
    }

    fn insert_entry_code(&mut self, function: &mut Function, key: FunctionKey) -> ByflResult<()> {
        let mut code = Vec::new();
        self.injector
            .call(&mut code, Routine::InitializeIfNecessary, vec![]);
        let key_arg: Operand = AnyConst::i32(key.0).into();
        if self.options.tally_by_function() {
            self.injector
                .call(&mut code, Routine::IncrFuncTally, vec![key_arg.clone()]);
        }
        if self.options.call_stack {
            let name = self.injector.string(&function.name);
            self.injector
                .call(&mut code, Routine::PushFunction, vec![name, key_arg]);
        }
        let code = self.injector.guarded(code);

        let entry = block_mut(function, Label::NIL)?;
        let phis = entry.phis().count();
        entry.insert(InsertionPoint::Before(phis), code)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn instrument_access(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        addr: &Operand,
        ty: Typeref,
        is_store: bool,
        code: &mut Vec<Instr>,
        clears: &mut CounterClears,
    ) -> ByflResult<()> {
        let options = self.options;
        let bytes = self.registry.byte_size(ty).ok_or(Error::UnknownType(ty))?;
        let (byte_counter, inst_counter, origin, reuse) = if is_store {
            (ScalarCounter::Stores, ScalarCounter::StoreInsts, "store", ReuseDistance::STORES)
        } else {
            (ScalarCounter::Loads, ScalarCounter::LoadInsts, "load", ReuseDistance::LOADS)
        };

        self.injector.add_scalar(code, byte_counter, bytes);
        self.injector.add_scalar(code, inst_counter, 1);
        *clears |= byte_counter.clear_flag() | inst_counter.clear_flag();

        if options.types {
            let mem_types = self.injector.counters().mem_types;
            let slot = mem_type_index(self.registry, ty, is_store);
            self.injector
                .add_to_array(code, mem_types, slot, AnyConst::i64(1).into());
            *clears |= CounterClears::MEM_TYPES;
        }

        let size: Operand = AnyConst::i64(bytes).into();
        let flag: Operand = AnyConst::i1(is_store).into();
        if options.data_structs {
            self.injector.call(
                code,
                Routine::AccessDataStruct,
                vec![addr.clone(), size.clone(), flag.clone()],
            );
        }
        if options.unique_bytes && options.tally_by_function() {
            self.injector.call(
                code,
                Routine::AssocAddressesWithFunc,
                vec![AnyConst::i32(scope.key.0).into(), addr.clone(), size.clone()],
            );
        }
        if options.unique_bytes || options.mem_footprint {
            self.injector.call(
                code,
                Routine::AssocAddressesWithProg,
                vec![addr.clone(), size.clone()],
            );
        }
        if options.reuse_distance_flags().contains(reuse) {
            self.injector.call(
                code,
                Routine::ReuseDistAddrsProg,
                vec![addr.clone(), size.clone()],
            );
        }
        if options.cache_model {
            self.injector
                .call(code, Routine::TouchCache, vec![addr.clone(), size.clone()]);
        }
        if options.strides {
            if is_constant_address(scope.original, addr) {
                trace!("{}: constant address {}, no stride", scope.original.name, addr);
            } else {
                let provenance = self
                    .resolver
                    .resolve_value(module, scope.original, addr, origin);
                let symbol = self.injector.symbol(provenance, self.ids);
                self.injector.call(
                    code,
                    Routine::TrackStride,
                    vec![symbol, addr.clone(), size, flag],
                );
            }
        }
        Ok(())
    }

    fn instrument_call(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        call: &Call,
        is_invoke: bool,
        clears: &mut CounterClears,
    ) -> ByflResult<CallCode> {
        let mut code = CallCode::default();
        let callee = call.callee();
        if callee.is_some_and(is_ignorable_call) {
            return Ok(code);
        }

        // Attribute what ran so far to the caller before control leaves it.
        // Invokes end their block, so the end-of-block flush precedes them.
        if self.options.tally_by_function() && !is_invoke && !callee.is_some_and(is_runtime_symbol)
        {
            let mask = if self.injector.counters().merge_count.is_some() {
                self.injector.counters().resettable()
            } else {
                *clears
            };
            self.injector
                .flush(&mut code.pre, Some(scope.key), BlockEnd::NotEnd, false, mask);
            *clears = CounterClears::empty();
        }

        self.injector.add_scalar(&mut code.counts, ScalarCounter::Calls, 1);
        *clears |= CounterClears::CALLS;

        if let Some(kind) = callee.and_then(memory_intrinsic) {
            self.count_memory_intrinsic(scope, call, kind, &mut code.counts, clears)?;
        }

        if self.options.data_structs {
            match callee.and_then(allocator) {
                Some(Allocator::Free) => {
                    if let Some(ptr) = call.args.first() {
                        self.injector.call(
                            &mut code.pre,
                            Routine::DisassocAddressesWithDstruct,
                            vec![ptr.clone()],
                        );
                    }
                }
                Some(alloc) => self.associate_allocation(module, scope, call, alloc, &mut code.post)?,
                None => {}
            }
        }
        Ok(code)
    }

    fn count_memory_intrinsic(
        &mut self,
        scope: &mut FunctionScope,
        call: &Call,
        kind: MemIntrinsic,
        code: &mut Vec<Instr>,
        clears: &mut CounterClears,
    ) -> ByflResult<()> {
        let Some(len) = call.args.get(2) else {
            warn!(
                "{}: {} call without a length operand",
                scope.original.name, call.function
            );
            return Ok(());
        };
        let len_ty = scope.types.operand_type(len)?;
        let len = self.injector.to_i64(code, len, len_ty);

        if kind.reads() {
            self.injector
                .add_scalar_dynamic(code, ScalarCounter::Loads, len.clone());
            *clears |= CounterClears::LOADS;
        }
        self.injector
            .add_scalar_dynamic(code, ScalarCounter::Stores, len.clone());
        *clears |= CounterClears::STORES;

        let (calls, bytes) = match kind {
            MemIntrinsic::Set => (MemIntrinsicTally::MemsetCalls, MemIntrinsicTally::MemsetBytes),
            MemIntrinsic::Copy | MemIntrinsic::Move => {
                (MemIntrinsicTally::MemxferCalls, MemIntrinsicTally::MemxferBytes)
            }
        };
        let tally = self.injector.counters().mem_intrinsics;
        self.injector
            .add_to_array(code, tally, calls as usize, AnyConst::i64(1).into());
        self.injector.add_to_array(code, tally, bytes as usize, len);
        Ok(())
    }

    fn associate_allocation(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        call: &Call,
        alloc: Allocator,
        code: &mut Vec<Instr>,
    ) -> ByflResult<()> {
        let arg = |index: usize| {
            call.args.get(index).ok_or_else(|| Error::UntypedOperand {
                function: scope.original.name.clone(),
                operand: format!("argument {} of {}", index, call.function),
            })
        };
        let origin = call.callee().unwrap_or("call");

        // The block comes back through `memptr`; the runtime reads it only
        // when the status is 0.
        if alloc == Allocator::PosixMemalign {
            let (memptr, bytes) = (arg(0)?, arg(2)?);
            let ty = scope.types.operand_type(bytes)?;
            let size = self.injector.to_i64(code, bytes, ty);
            let status = match call.dest {
                Some(dest) => {
                    let status = Operand::Reg(dest);
                    let ty = scope.types.operand_type(&status)?;
                    self.injector.to_i64(code, &status, ty)
                }
                None => AnyConst::i64(0).into(),
            };
            let provenance = self
                .resolver
                .resolve_value(module, scope.original, memptr, origin);
            let symbol = self.injector.symbol(provenance, self.ids);
            self.injector.call(
                code,
                Routine::AssocAddressesWithDstructPm,
                vec![symbol, memptr.clone(), size, status],
            );
            return Ok(());
        }

        let Some(dest) = call.dest else {
            return Ok(());
        };

        let (old, size) = match alloc {
            Allocator::Malloc => {
                let bytes = arg(0)?;
                let ty = scope.types.operand_type(bytes)?;
                (AnyConst::Null.into(), self.injector.to_i64(code, bytes, ty))
            }
            Allocator::Calloc => {
                let (count, each) = (arg(0)?, arg(1)?);
                let count_ty = scope.types.operand_type(count)?;
                let each_ty = scope.types.operand_type(each)?;
                let count = self.injector.to_i64(code, count, count_ty);
                let each = self.injector.to_i64(code, each, each_ty);
                (AnyConst::Null.into(), self.injector.mul_i64(code, count, each))
            }
            Allocator::Realloc => {
                let (old, bytes) = (arg(0)?, arg(1)?);
                let ty = scope.types.operand_type(bytes)?;
                (old.clone(), self.injector.to_i64(code, bytes, ty))
            }
            Allocator::PosixMemalign | Allocator::Free => return Ok(()),
        };

        let provenance =
            self.resolver
                .resolve_value(module, scope.original, &Operand::Reg(dest), origin);
        let symbol = self.injector.symbol(provenance, self.ids);
        self.injector.call(
            code,
            Routine::AssocAddressesWithDstruct,
            vec![symbol, old, Operand::Reg(dest), size],
        );
        Ok(())
    }

    fn instrument_alloca(
        &mut self,
        module: &Module,
        scope: &mut FunctionScope,
        alloca: &MAlloca,
        code: &mut Vec<Instr>,
    ) -> ByflResult<()> {
        if !self.options.data_structs {
            return Ok(());
        }
        let elem = self
            .registry
            .byte_size(alloca.ty)
            .ok_or(Error::UnknownType(alloca.ty))?;
        let count_ty = scope.types.operand_type(&alloca.count)?;
        let count = self.injector.to_i64(code, &alloca.count, count_ty);
        let bytes = self
            .injector
            .mul_i64(code, AnyConst::i64(elem).into(), count);

        let object = Operand::Reg(alloca.dest);
        let provenance = self
            .resolver
            .resolve_value(module, scope.original, &object, "alloca");
        let symbol = self.injector.symbol(provenance, self.ids);
        self.injector.call(
            code,
            Routine::AssocAddressesWithDstructStack,
            vec![symbol, object, bytes],
        );
        Ok(())
    }

    /// Op, flop, vector, mix and dependency tallies shared by instructions
    /// and terminators.
    #[allow(clippy::too_many_arguments)]
    fn count_operation(
        &mut self,
        scope: &mut FunctionScope,
        cls: &Classification,
        opcode: usize,
        operands: &[&Operand],
        result: Option<Typeref>,
        site: (Label, usize),
        text: impl FnOnce() -> String,
        code: &mut Vec<Instr>,
        clears: &mut CounterClears,
    ) -> ByflResult<()> {
        let registry = self.registry;

        if !cls.is_no_op {
            self.injector.add_scalar(code, ScalarCounter::Ops, 1);
            self.injector
                .add_scalar(code, ScalarCounter::OpBits, cls.bit_width);
            *clears |= CounterClears::OPS | CounterClears::OP_BITS;
        }
        if cls.is_fp {
            self.injector
                .add_scalar(code, ScalarCounter::Flops, cls.vector_length);
            self.injector
                .add_scalar(code, ScalarCounter::FpBits, cls.bit_width);
            *clears |= CounterClears::FLOPS | CounterClears::FP_BITS;
        }

        if self.options.vectors {
            let mut types: Vec<Typeref> = result.into_iter().collect();
            for operand in operands.iter().filter(|op| !matches!(op, Operand::Function(_))) {
                types.push(scope.types.operand_type(operand)?);
            }
            if let Some((elements, element_bits)) = vector_operation(registry, &types) {
                let tag = scope
                    .strings
                    .tag(&mut self.injector, site.0, site.1, text);
                self.injector.call(
                    code,
                    Routine::TallyVectorOperation,
                    vec![
                        tag,
                        AnyConst::i64(elements).into(),
                        AnyConst::i64(element_bits).into(),
                        AnyConst::i1(cls.is_fp).into(),
                    ],
                );
            }
        }

        if let Some(mix) = self.injector.counters().inst_mix {
            self.injector
                .add_to_array(code, mix, opcode, AnyConst::i64(1).into());
        }

        if self.injector.counters().inst_deps.is_some() {
            let consumer = DepType::of(registry, result);
            for operand in operands {
                let (row, producer) = match operand {
                    Operand::Reg(name) => scope.producers.get(name).copied().unwrap_or_else(|| {
                        let ty = scope.types.values.get(name).copied();
                        (DEP_PRODUCER_ARGUMENT, DepType::of(registry, ty))
                    }),
                    Operand::Imm(constant) => (
                        DEP_PRODUCER_CONSTANT,
                        DepType::of(registry, Some(constant.type_of(registry))),
                    ),
                    Operand::Global(_) | Operand::Function(_) => continue,
                };
                self.injector.add_dependency(
                    code,
                    [row, producer as usize, opcode, consumer as usize],
                );
            }
        }
        Ok(())
    }

    /// Constructor associating every user global with its symbol record.
    fn emit_track_globals(&mut self, module: &mut Module) -> ByflResult<()> {
        if module.function(magic::TRACK_GLOBALS_CTOR).is_some() {
            warn!(
                "{} is already defined, the module was instrumented before",
                magic::TRACK_GLOBALS_CTOR
            );
            return Ok(());
        }

        let mut code = Vec::new();
        for global in module
            .globals
            .iter()
            .filter(|global| global.is_definition() && !is_runtime_symbol(&global.name))
        {
            let size = self
                .registry
                .byte_size(global.ty)
                .ok_or(Error::UnknownType(global.ty))?;
            let symbol = self
                .injector
                .symbol(self.resolver.resolve_global(global), self.ids);
            self.injector.call(
                &mut code,
                Routine::AssocAddressesWithSstruct,
                vec![
                    symbol,
                    Operand::Global(global.name.clone()),
                    AnyConst::i64(size).into(),
                ],
            );
        }

        let mut builder = FunctionBuilder::new(self.registry, magic::TRACK_GLOBALS_CTOR, &[], None);
        builder.set_linkage(Linkage::Private);
        for instr in code {
            builder.push(instr);
        }
        builder.ret(None);
        module.functions.push(builder.finish());
        module.add_constructor(magic::TRACK_GLOBALS_CTOR);
        Ok(())
    }

    /// The key → name table and the constructor handing it to the runtime.
    fn emit_key_table(&mut self, module: &mut Module) {
        if module.function(magic::INIT_FUNC_MAP_CTOR).is_some() {
            warn!(
                "{} is already defined, the module was instrumented before",
                magic::INIT_FUNC_MAP_CTOR
            );
            return;
        }

        let i32_ty = self.registry.int(32);
        let ptr = self.registry.ptr();
        let mut values = Vec::with_capacity(self.keys.len());
        let mut names = Vec::with_capacity(self.keys.len());
        for (key, name) in self.keys.table() {
            values.push(AnyConst::i32(key.0));
            names.push(AnyConst::GlobalAddr(
                self.injector.declarations().string(self.registry, name),
            ));
        }

        let count = self.keys.len() as u64;
        let decls = self.injector.declarations();
        decls.global(
            GlobalVariable::new(
                magic::FUNC_KEY_COUNT,
                i32_ty,
                AnyConst::i32(count as u32),
                Linkage::Private,
            )
            .read_only(),
        );
        decls.global(
            GlobalVariable::new(
                magic::FUNC_KEY_VALUES,
                self.registry.array(i32_ty, count),
                AnyConst::Array {
                    elem: i32_ty,
                    elems: values,
                },
                Linkage::Private,
            )
            .read_only(),
        );
        decls.global(
            GlobalVariable::new(
                magic::FUNC_KEY_NAMES,
                self.registry.array(ptr, count),
                AnyConst::Array {
                    elem: ptr,
                    elems: names,
                },
                Linkage::Private,
            )
            .read_only(),
        );
        decls.routine(Routine::RecordFuncs2Keys);

        let mut builder = FunctionBuilder::new(self.registry, magic::INIT_FUNC_MAP_CTOR, &[], None);
        builder.set_linkage(Linkage::Private);
        let count = builder.load(i32_ty, Operand::Global(magic::FUNC_KEY_COUNT.to_string()));
        builder.call(
            Routine::RecordFuncs2Keys.name(),
            None,
            vec![
                count,
                Operand::Global(magic::FUNC_KEY_VALUES.to_string()),
                Operand::Global(magic::FUNC_KEY_NAMES.to_string()),
            ],
        );
        builder.ret(None);
        module.functions.push(builder.finish());
        module.add_constructor(magic::INIT_FUNC_MAP_CTOR);
    }

    /// Mnemonics indexed like the instruction-mix histogram.
    fn emit_opcode_names(&mut self) {
        let ptr = self.registry.ptr();
        let names: Vec<AnyConst> = opcode_names()
            .into_iter()
            .map(|name| AnyConst::GlobalAddr(self.injector.declarations().string(self.registry, name)))
            .collect();
        debug_assert_eq!(names.len(), NUM_OPCODES);

        self.injector.declarations().global(
            GlobalVariable::new(
                magic::OPCODE_NAMES,
                self.registry.array(ptr, names.len() as u64),
                AnyConst::Array {
                    elem: ptr,
                    elems: names,
                },
                Linkage::LinkOnce,
            )
            .read_only(),
        );
    }
}

#[cfg(test)]
mod tests {
    use byinstr::{
        consts::AnyConst,
        modules::{int::ICmpOp, misc::CastOp},
    };

    use crate::symbols::{DebugInfoResolver, SequentialIds};

    use super::*;

    fn run(module: &mut Module, registry: &TypeRegistry, options: &InstrumentOptions) -> InstrumentationSummary {
        let mut ids = SequentialIds::default();
        instrument_module_with_ids(module, registry, options, &DebugInfoResolver, &mut ids).unwrap()
    }

    fn callees(block: &BasicBlock) -> Vec<&str> {
        block
            .instructions
            .iter()
            .filter_map(|instr| match instr {
                Instr::Call(call) => call.callee(),
                _ => None,
            })
            .collect()
    }

    /// `sum(p, n)`: loads `n` doubles through `p` and adds them.
    fn sum_module(registry: &TypeRegistry) -> Module {
        let (i64_ty, f64_ty) = (registry.int(64), registry.float(byinstr::types::primary::FType::Fp64));
        let mut b = FunctionBuilder::new(registry, "sum", &[registry.ptr(), i64_ty], Some(f64_ty));
        let (p, n) = (b.param(0), b.param(1));
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        b.jump(header);

        b.switch_to(header);
        let (i, acc, next_i, next_acc) = (b.fresh(), b.fresh(), b.fresh(), b.fresh());
        b.phi_into(i, i64_ty, vec![(Label::NIL, AnyConst::i64(0).into()), (body, next_i.into())]);
        b.phi_into(acc, f64_ty, vec![(Label::NIL, AnyConst::f64(0.0).into()), (body, next_acc.into())]);
        let done = b.icmp(ICmpOp::Uge, i64_ty, i.into(), n);
        b.branch(done, exit, body);

        b.switch_to(body);
        let slot = b.gep(f64_ty, p, vec![i.into()]);
        let x = b.load(f64_ty, slot);
        b.push(byinstr::modules::fp::FAdd {
            dest: next_acc,
            ty: f64_ty,
            lhs: acc.into(),
            rhs: x,
        });
        b.push(byinstr::modules::int::IAdd {
            dest: next_i,
            ty: i64_ty,
            lhs: i.into(),
            rhs: AnyConst::i64(1).into(),
        });
        b.jump(header);

        b.switch_to(exit);
        b.ret(Some(acc.into()));

        let mut module = Module::new("sum");
        module.functions.push(b.finish());
        module
    }

    #[test]
    fn static_counts_cover_instructions_and_terminators() {
        let registry = TypeRegistry::new();
        let mut module = sum_module(&registry);
        let summary = run(&mut module, &registry, &InstrumentOptions::default());

        assert_eq!(summary.static_loads, 1);
        assert_eq!(summary.static_stores, 0);
        assert_eq!(summary.static_flops, 1);
        // icmp, gep, load, fadd, add and four terminators; phis are free.
        assert_eq!(summary.static_ops, 9);
        assert_eq!(summary.static_cond_brs, 1);
        assert_eq!(summary.static_blocks, 4);
        assert_eq!(summary.instrumented_functions, 1);
        assert_eq!(summary.inner_loops.len(), 1);

        let sum = module.function("sum").unwrap();
        sum.check_ssa().unwrap();
        let entry = &sum.body[&Label::NIL];
        assert_eq!(callees(entry)[0], "bf_initialize_if_necessary");
        assert!(module.external_function("bf_accumulate_bb_tallies").is_some());
        assert!(module.constructors.contains(&magic::INIT_FUNC_MAP_CTOR.to_string()));
    }

    #[test]
    fn phis_stay_at_the_head_of_their_block() {
        let registry = TypeRegistry::new();
        let mut module = sum_module(&registry);
        let options = InstrumentOptions {
            inst_mix: true,
            inst_deps: true,
            ..Default::default()
        };
        run(&mut module, &registry, &options);

        let sum = module.function("sum").unwrap();
        let header = &sum.body[&Label(1)];
        assert!(matches!(header.instructions[0], Instr::Phi(_)));
        assert!(matches!(header.instructions[1], Instr::Phi(_)));
        sum.check_ssa().unwrap();
        assert!(module.global(magic::OPCODE_NAMES).is_some());
        assert!(module.global(magic::INST_DEPS_HISTO).is_some());
    }

    #[test]
    fn merged_blocks_branch_to_a_flush_block() {
        let registry = TypeRegistry::new();
        let mut module = sum_module(&registry);
        let options = InstrumentOptions {
            merge_bb: 4,
            ..Default::default()
        };
        run(&mut module, &registry, &options);

        let sum = module.function("sum").unwrap();
        sum.check_ssa().unwrap();
        // Each of the four blocks gained a continuation and a flush block.
        assert_eq!(sum.body.len(), 12);

        let entry = &sum.body[&Label::NIL];
        let Terminator::CBranch(branch) = &entry.terminator else {
            panic!("entry should end with the merge check");
        };
        let flush = &sum.body[&branch.target_true];
        assert!(callees(flush).contains(&"bf_accumulate_bb_tallies"));
        assert!(!callees(entry).contains(&"bf_accumulate_bb_tallies"));
        assert!(matches!(
            &sum.body[&branch.target_false].terminator,
            Terminator::Jump(jump) if jump.target == Label(1)
        ));

        // The header's phis now name the continuation blocks.
        let header = &sum.body[&Label(1)];
        let phi = header.phis().next().unwrap();
        assert!(phi.incoming(Label::NIL).is_none());
        assert!(phi.incoming(branch.target_false).is_some());
    }

    #[test]
    fn data_structs_track_allocations() {
        let registry = TypeRegistry::new();
        let (i32_ty, i64_ty, ptr) = (registry.int(32), registry.int(64), registry.ptr());
        let mut b = FunctionBuilder::new(&registry, "main", &[i32_ty], None);
        let n = b.param(0);
        let n64 = b.cast(CastOp::ZExt, i32_ty, i64_ty, n);
        let buffer = b.call("malloc", Some(ptr), vec![n64]).unwrap();
        let (_, slot) = b.alloca(i64_ty);
        b.store(i64_ty, AnyConst::i64(0).into(), Operand::Reg(slot));
        b.call("free", None, vec![buffer]);
        b.ret(None);

        let mut module = Module::new("alloc");
        module.functions.push(b.finish());
        module.external_functions.push(byinstr::modules::symbol::ExternalFunction {
            name: "malloc".to_string(),
            param_types: vec![i64_ty],
            return_type: Some(ptr),
        });
        module.globals.push(GlobalVariable::new(
            "table",
            registry.array(i64_ty, 4),
            AnyConst::Zero(registry.array(i64_ty, 4)),
            Linkage::Internal,
        ));

        let options = InstrumentOptions {
            data_structs: true,
            ..Default::default()
        };
        run(&mut module, &registry, &options);

        let main = module.function("main").unwrap();
        let calls = callees(&main.body[&Label::NIL]);
        let position = |name: &str| calls.iter().position(|c| *c == name).unwrap();
        assert!(position("malloc") < position("bf_assoc_addresses_with_dstruct"));
        assert!(position("bf_disassoc_addresses_with_dstruct") < position("free"));
        assert!(calls.contains(&"bf_assoc_addresses_with_dstruct_stack"));
        assert!(calls.contains(&"bf_access_data_struct"));

        let track = module.function(magic::TRACK_GLOBALS_CTOR).unwrap();
        assert_eq!(
            callees(&track.body[&Label::NIL]),
            vec!["bf_assoc_addresses_with_sstruct"]
        );
        assert!(module.global("bf.syminfo.0").is_some());
    }

    #[test]
    fn posix_memalign_is_associated_through_its_out_pointer() {
        let registry = TypeRegistry::new();
        let (i32_ty, i64_ty, ptr) = (registry.int(32), registry.int(64), registry.ptr());
        let mut b = FunctionBuilder::new(&registry, "main", &[i64_ty], None);
        let n = b.param(0);
        let (memptr, _) = b.alloca(ptr);
        let status = b
            .call(
                "posix_memalign",
                Some(i32_ty),
                vec![memptr.clone(), AnyConst::i64(64).into(), n.clone()],
            )
            .unwrap();
        b.ret(None);

        let mut module = Module::new("aligned");
        module.functions.push(b.finish());
        module.external_functions.push(byinstr::modules::symbol::ExternalFunction {
            name: "posix_memalign".to_string(),
            param_types: vec![ptr, i64_ty, i64_ty],
            return_type: Some(i32_ty),
        });
        let options = InstrumentOptions {
            data_structs: true,
            ..Default::default()
        };
        run(&mut module, &registry, &options);

        let main = module.function("main").unwrap();
        main.check_ssa().unwrap();
        let block = &main.body[&Label::NIL];
        let calls = callees(block);
        let position = |name: &str| calls.iter().position(|c| *c == name).unwrap();
        assert!(position("posix_memalign") < position("bf_assoc_addresses_with_dstruct_pm"));
        assert!(!calls.contains(&"bf_assoc_addresses_with_dstruct"));

        let assoc = block
            .instructions
            .iter()
            .find_map(|instr| match instr {
                Instr::Call(call)
                    if call.callee() == Some("bf_assoc_addresses_with_dstruct_pm") =>
                {
                    Some(call)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(assoc.args[1], memptr);
        assert_eq!(assoc.args[2], n);
        let Operand::Reg(status_reg) = &assoc.args[3] else {
            panic!("status should be a register, found {}", assoc.args[3]);
        };
        // The i32 status is widened to i64 before being passed on.
        assert_ne!(Operand::Reg(*status_reg), status);
        assert!(
            module
                .external_functions
                .iter()
                .any(|f| f.name == "bf_assoc_addresses_with_dstruct_pm")
        );
    }

    #[test]
    fn failures_leave_the_module_untouched() {
        let registry = TypeRegistry::new();
        let i64_ty = registry.int(64);
        let mut b = FunctionBuilder::new(&registry, "broken", &[], Some(i64_ty));
        let bogus = b.iadd(i64_ty, Operand::Reg(Name(42)), AnyConst::i64(1).into());
        b.ret(Some(bogus));
        let mut module = Module::new("broken");
        module.functions.push(b.finish());
        let before = module.clone();

        let mut ids = SequentialIds::default();
        let err = instrument_module_with_ids(
            &mut module,
            &registry,
            &InstrumentOptions::default(),
            &DebugInfoResolver,
            &mut ids,
        );
        assert!(err.is_err());
        assert_eq!(module, before);
    }
}
