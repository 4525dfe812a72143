//! Layout of the counters shared with the runtime.
//!
//! The counters are module globals, `i64` scalars and fixed-size `i64`
//! arrays. The runtime reads them at every flush, so their names and sizes
//! are part of the interface and never change during a compilation.
use bitflags::bitflags;
use byinstr::{
    consts::AnyConst,
    modules::{Linkage, operand::Operand, symbol::GlobalVariable},
    types::{
        AnyType, TypeRegistry, Typeref,
        primary::{PrimaryBasicType, PrimaryType},
    },
};
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{classify::NUM_OPCODES, magic, utils::conf::InstrumentOptions};

bitflags! {
    /// Per-block counters a block touched and must zero after a flush.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CounterClears: u32 {
        const LOADS = 1 << 0;
        const STORES = 1 << 1;
        const LOAD_INSTS = 1 << 2;
        const STORE_INSTS = 1 << 3;
        const FLOPS = 1 << 4;
        const FP_BITS = 1 << 5;
        const OPS = 1 << 6;
        const OP_BITS = 1 << 7;
        const CALLS = 1 << 8;
        const MEM_TYPES = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum ScalarCounter {
    Loads,
    Stores,
    LoadInsts,
    StoreInsts,
    Flops,
    FpBits,
    Ops,
    OpBits,
    Calls,
}

impl ScalarCounter {
    pub fn global_name(self) -> &'static str {
        match self {
            ScalarCounter::Loads => magic::LOAD_COUNT,
            ScalarCounter::Stores => magic::STORE_COUNT,
            ScalarCounter::LoadInsts => magic::LOAD_INST_COUNT,
            ScalarCounter::StoreInsts => magic::STORE_INST_COUNT,
            ScalarCounter::Flops => magic::FLOP_COUNT,
            ScalarCounter::FpBits => magic::FP_BITS_COUNT,
            ScalarCounter::Ops => magic::OP_COUNT,
            ScalarCounter::OpBits => magic::OP_BITS_COUNT,
            ScalarCounter::Calls => magic::CALL_INST_COUNT,
        }
    }

    pub fn clear_flag(self) -> CounterClears {
        match self {
            ScalarCounter::Loads => CounterClears::LOADS,
            ScalarCounter::Stores => CounterClears::STORES,
            ScalarCounter::LoadInsts => CounterClears::LOAD_INSTS,
            ScalarCounter::StoreInsts => CounterClears::STORE_INSTS,
            ScalarCounter::Flops => CounterClears::FLOPS,
            ScalarCounter::FpBits => CounterClears::FP_BITS,
            ScalarCounter::Ops => CounterClears::OPS,
            ScalarCounter::OpBits => CounterClears::OP_BITS,
            ScalarCounter::Calls => CounterClears::CALLS,
        }
    }
}

// Axes of the memory-type tally, outermost first.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemOp {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemRef {
    Value,
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemAgg {
    Scalar,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemType {
    Int,
    Fp,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemWidth {
    W8,
    W16,
    W32,
    W64,
    W128,
    Other,
}

impl MemWidth {
    fn of_bits(bits: u32) -> Self {
        match bits {
            8 => MemWidth::W8,
            16 => MemWidth::W16,
            32 => MemWidth::W32,
            64 => MemWidth::W64,
            128 => MemWidth::W128,
            _ => MemWidth::Other,
        }
    }
}

pub const NUM_MEM_TYPES: usize =
    MemOp::COUNT * MemRef::COUNT * MemAgg::COUNT * MemType::COUNT * MemWidth::COUNT;

/// Slot of the memory-type tally for a load or store of a `ty` value.
pub fn mem_type_index(registry: &TypeRegistry, ty: Typeref, is_store: bool) -> usize {
    let op = if is_store { MemOp::Store } else { MemOp::Load };

    let (agg, element) = match registry.lookup(ty) {
        Some(AnyType::Primary(PrimaryType::Vc(vc))) => (MemAgg::Vector, Some(vc.ty)),
        Some(AnyType::Primary(PrimaryType::Int(itype))) => (MemAgg::Scalar, Some(itype.into())),
        Some(AnyType::Primary(PrimaryType::Float(ftype))) => (MemAgg::Scalar, Some(ftype.into())),
        Some(AnyType::Primary(PrimaryType::Ptr(ptr))) => (MemAgg::Scalar, Some(ptr.into())),
        _ => (MemAgg::Scalar, None),
    };

    let (mem_ref, mem_type, width) = match element {
        Some(PrimaryBasicType::Int(itype)) => {
            (MemRef::Value, MemType::Int, MemWidth::of_bits(itype.num_bits()))
        }
        Some(PrimaryBasicType::Float(ftype)) => {
            (MemRef::Value, MemType::Fp, MemWidth::of_bits(ftype.num_bits()))
        }
        Some(elem @ PrimaryBasicType::Ptr(_)) => (
            MemRef::Pointer,
            MemType::Other,
            MemWidth::of_bits(elem.num_bits()),
        ),
        None => (MemRef::Value, MemType::Other, MemWidth::Other),
    };

    let index = op as usize;
    let index = index * MemRef::COUNT + mem_ref as usize;
    let index = index * MemAgg::COUNT + agg as usize;
    let index = index * MemType::COUNT + mem_type as usize;
    index * MemWidth::COUNT + width as usize
}

/// Slots of the terminator tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum TerminatorTally {
    Any,
    Unconditional,
    Conditional,
}

/// Slots of the memory-intrinsic tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MemIntrinsicTally {
    MemsetCalls,
    MemsetBytes,
    MemxferCalls,
    MemxferBytes,
}

/// Type axis of the dependency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum DepType {
    Int,
    Fp,
    Ptr,
    Vector,
    Other,
}

impl DepType {
    /// `None` is the type of instructions without a result.
    pub fn of(registry: &TypeRegistry, ty: Option<Typeref>) -> Self {
        match ty.and_then(|ty| registry.lookup(ty)) {
            Some(AnyType::Primary(PrimaryType::Int(_))) => DepType::Int,
            Some(AnyType::Primary(PrimaryType::Float(_))) => DepType::Fp,
            Some(AnyType::Primary(PrimaryType::Ptr(_))) => DepType::Ptr,
            Some(AnyType::Primary(PrimaryType::Vc(_))) => DepType::Vector,
            _ => DepType::Other,
        }
    }
}

/// Producer row used for constant operands.
pub const DEP_PRODUCER_CONSTANT: usize = NUM_OPCODES;
/// Producer row used for arguments and values of unknown origin.
pub const DEP_PRODUCER_ARGUMENT: usize = NUM_OPCODES + 1;
pub const NUM_DEP_PRODUCERS: usize = NUM_OPCODES + 2;

/// A global `[len x i64]` counter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterArray {
    pub name: &'static str,
    pub ty: Typeref,
    pub len: u64,
}

impl CounterArray {
    fn new(registry: &TypeRegistry, name: &'static str, len: usize) -> Self {
        Self {
            name,
            ty: registry.array(registry.int(64), len as u64),
            len: len as u64,
        }
    }

    pub fn operand(&self) -> Operand {
        Operand::Global(self.name.to_string())
    }

    /// Storage size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.len * 8
    }
}

/// The `[producer][producer type][consumer][consumer type]` histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepsHistogram {
    pub name: &'static str,
    pub ty: Typeref,
    pub dims: [u64; 4],
}

impl DepsHistogram {
    fn new(registry: &TypeRegistry) -> Self {
        let dims = [
            NUM_DEP_PRODUCERS as u64,
            DepType::COUNT as u64,
            NUM_OPCODES as u64,
            DepType::COUNT as u64,
        ];
        let ty = dims
            .iter()
            .rev()
            .fold(registry.int(64), |inner, len| registry.array(inner, *len));
        Self {
            name: magic::INST_DEPS_HISTO,
            ty,
            dims,
        }
    }
}

/// Every counter the instrumented module defines.
#[derive(Debug, Clone)]
pub struct CounterSet {
    /// `i64`, the type of every counter cell.
    pub counter_ty: Typeref,
    pub mem_types: CounterArray,
    pub terminators: CounterArray,
    pub mem_intrinsics: CounterArray,
    pub inst_mix: Option<CounterArray>,
    pub inst_deps: Option<DepsHistogram>,
    /// Merge counter, present when blocks are merged.
    pub merge_count: Option<&'static str>,
    tracks_types: bool,
}

impl CounterSet {
    pub fn new(registry: &TypeRegistry, options: &InstrumentOptions) -> Self {
        Self {
            counter_ty: registry.int(64),
            mem_types: CounterArray::new(registry, magic::MEM_INSTS_COUNT, NUM_MEM_TYPES),
            terminators: CounterArray::new(
                registry,
                magic::TERMINATOR_COUNT,
                TerminatorTally::COUNT,
            ),
            mem_intrinsics: CounterArray::new(
                registry,
                magic::MEM_INTRIN_COUNT,
                MemIntrinsicTally::COUNT,
            ),
            inst_mix: options
                .inst_mix
                .then(|| CounterArray::new(registry, magic::INST_MIX_HISTO, NUM_OPCODES)),
            inst_deps: options.inst_deps.then(|| DepsHistogram::new(registry)),
            merge_count: (options.merge_bb > 1).then_some(magic::BB_MERGE_COUNT),
            tracks_types: options.types,
        }
    }

    pub fn scalar(&self, counter: ScalarCounter) -> Operand {
        Operand::Global(counter.global_name().to_string())
    }

    /// Counters a flush can zero. The memory-type array only counts when
    /// types are tracked.
    pub fn resettable(&self) -> CounterClears {
        if self.tracks_types {
            CounterClears::all()
        } else {
            CounterClears::all() - CounterClears::MEM_TYPES
        }
    }

    /// Zero-initialized, link-once definitions of every counter.
    pub fn globals(&self) -> Vec<GlobalVariable> {
        let zero = |name: &str, ty: Typeref| {
            GlobalVariable::new(name, ty, AnyConst::Zero(ty), Linkage::LinkOnce)
        };

        let mut globals: Vec<GlobalVariable> = ScalarCounter::iter()
            .map(|counter| zero(counter.global_name(), self.counter_ty))
            .collect();
        for array in [self.mem_types, self.terminators, self.mem_intrinsics]
            .into_iter()
            .chain(self.inst_mix)
        {
            globals.push(zero(array.name, array.ty));
        }
        if let Some(deps) = &self.inst_deps {
            globals.push(zero(deps.name, deps.ty));
        }
        if let Some(name) = self.merge_count {
            globals.push(zero(name, self.counter_ty));
        }
        globals
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use byinstr::types::primary::{FType, IType};

    use super::*;

    #[test]
    fn memory_type_slots_are_distinct_and_in_range() {
        let reg = TypeRegistry::new();
        let types = [
            reg.int(8),
            reg.int(32),
            reg.int(64),
            reg.float(FType::Fp32),
            reg.float(FType::Fp64),
            reg.ptr(),
            reg.vector(IType::I32, 4),
            reg.vector(FType::Fp64, 2),
        ];

        let mut seen = BTreeSet::new();
        for ty in types {
            for is_store in [false, true] {
                let index = mem_type_index(&reg, ty, is_store);
                assert!(index < NUM_MEM_TYPES);
                assert!(seen.insert(index), "slot {} reused", index);
            }
        }

        // Aggregates share the "other" slot.
        let a = mem_type_index(&reg, reg.array(reg.int(8), 4), false);
        let b = mem_type_index(&reg, reg.structure(vec![reg.int(8)]), false);
        assert_eq!(a, b);
    }

    #[test]
    fn counter_set_follows_options() {
        let reg = TypeRegistry::new();
        let plain = CounterSet::new(&reg, &InstrumentOptions::default());
        assert!(plain.inst_mix.is_none() && plain.inst_deps.is_none());
        assert!(plain.merge_count.is_none());
        assert!(!plain.resettable().contains(CounterClears::MEM_TYPES));
        assert_eq!(plain.globals().len(), ScalarCounter::COUNT + 3);

        let options = InstrumentOptions {
            inst_mix: true,
            inst_deps: true,
            merge_bb: 4,
            ..Default::default()
        };
        let full = CounterSet::new(&reg, &options);
        assert_eq!(full.globals().len(), ScalarCounter::COUNT + 6);

        let deps = full.inst_deps.unwrap();
        let cells: u64 = deps.dims.iter().product();
        assert_eq!(reg.byte_size(deps.ty), Some(cells * 8));
        assert_eq!(full.inst_mix.unwrap().len, NUM_OPCODES as u64);
        assert!(
            full.globals()
                .iter()
                .all(|g| g.linkage == Linkage::LinkOnce && !g.constant)
        );
    }
}
