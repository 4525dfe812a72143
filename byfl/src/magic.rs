//! Names shared with the runtime library.
//!
//! Everything the pass defines or references by name lives here: counter
//! globals, published option constants, generated constructors and the
//! runtime routines with their signatures.
use byinstr::{modules::symbol::ExternalFunction, types::TypeRegistry};
use strum::{EnumCount, EnumIter, IntoStaticStr};

/// Prefix of every symbol the runtime defines or the pass generates.
pub const RUNTIME_PREFIX: &str = "bf_";

/// Prefix of functions and private globals generated by the pass.
pub const GENERATED_PREFIX: &str = "bf.";

/// Returns true if `name` belongs to the runtime or was generated by the pass.
pub fn is_runtime_symbol(name: &str) -> bool {
    name.starts_with(RUNTIME_PREFIX) || name.starts_with(GENERATED_PREFIX)
}

// Scalar counters. Each is an `i64` global.
pub const LOAD_COUNT: &str = "bf_load_count";
pub const STORE_COUNT: &str = "bf_store_count";
pub const LOAD_INST_COUNT: &str = "bf_load_ins_count";
pub const STORE_INST_COUNT: &str = "bf_store_ins_count";
pub const FLOP_COUNT: &str = "bf_flop_count";
pub const FP_BITS_COUNT: &str = "bf_fp_bits_count";
pub const OP_COUNT: &str = "bf_op_count";
pub const OP_BITS_COUNT: &str = "bf_op_bits_count";
pub const CALL_INST_COUNT: &str = "bf_call_ins_count";

// Counter arrays.
pub const MEM_INSTS_COUNT: &str = "bf_mem_insts_count";
pub const TERMINATOR_COUNT: &str = "bf_terminator_count";
pub const MEM_INTRIN_COUNT: &str = "bf_mem_intrin_count";
pub const INST_MIX_HISTO: &str = "bf_inst_mix_histo";
pub const INST_DEPS_HISTO: &str = "bf_inst_deps_histo";

/// Number of basic blocks executed since the last merged flush.
pub const BB_MERGE_COUNT: &str = "bf_bb_merge_count";

// Function key table.
pub const FUNC_KEY_COUNT: &str = "bf_func_key_count";
pub const FUNC_KEY_VALUES: &str = "bf_func_key_values";
pub const FUNC_KEY_NAMES: &str = "bf_func_key_names";

/// Mnemonics indexed like the instruction-mix histogram.
pub const OPCODE_NAMES: &str = "bf_opcode_names";

// Published option constants.
pub const OPT_EVERY_BB: &str = "bf_every_bb";
pub const OPT_BB_MERGE: &str = "bf_bb_merge";
pub const OPT_TYPES: &str = "bf_types";
pub const OPT_INST_MIX: &str = "bf_tally_inst_mix";
pub const OPT_INST_DEPS: &str = "bf_tally_inst_deps";
pub const OPT_PER_FUNC: &str = "bf_per_func";
pub const OPT_CALL_STACK: &str = "bf_call_stack";
pub const OPT_UNIQUE_BYTES: &str = "bf_unique_bytes";
pub const OPT_MEM_FOOTPRINT: &str = "bf_mem_footprint";
pub const OPT_DATA_STRUCTS: &str = "bf_data_structs";
pub const OPT_VECTORS: &str = "bf_vectors";
pub const OPT_REUSE_DIST: &str = "bf_reuse_dist";
pub const OPT_MAX_REUSE_DIST: &str = "bf_max_reuse_distance";
pub const OPT_CACHE_MODEL: &str = "bf_cache_model";
pub const OPT_LINE_SIZE: &str = "bf_line_size";
pub const OPT_MAX_SET_BITS: &str = "bf_max_set_bits";
pub const OPT_STRIDES: &str = "bf_strides";
pub const OPT_THREAD_SAFE: &str = "bf_thread_safe";
pub const OPT_OPTION_STRING: &str = "bf_option_string";

// Generated constructors.
pub const INIT_FUNC_MAP_CTOR: &str = "bf.init_func_map";
pub const TRACK_GLOBALS_CTOR: &str = "bf.track_globals";

/// Memset intrinsic used to clear counter arrays.
pub const MEMSET_INTRINSIC: &str = "llvm.memset.p0.i64";

/// Routines provided by the runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount, IntoStaticStr)]
pub enum Routine {
    #[strum(serialize = "bf_initialize_if_necessary")]
    InitializeIfNecessary,
    #[strum(serialize = "bf_accumulate_bb_tallies")]
    AccumulateBbTallies,
    #[strum(serialize = "bf_report_bb_tallies")]
    ReportBbTallies,
    #[strum(serialize = "bf_reset_bb_tallies")]
    ResetBbTallies,
    #[strum(serialize = "bf_assoc_counters_with_func")]
    AssocCountersWithFunc,
    #[strum(serialize = "bf_incr_func_tally")]
    IncrFuncTally,
    #[strum(serialize = "bf_push_function")]
    PushFunction,
    #[strum(serialize = "bf_pop_function")]
    PopFunction,
    #[strum(serialize = "bf_acquire_mega_lock")]
    AcquireMegaLock,
    #[strum(serialize = "bf_release_mega_lock")]
    ReleaseMegaLock,
    #[strum(serialize = "bf_tally_vector_operation")]
    TallyVectorOperation,
    #[strum(serialize = "bf_access_data_struct")]
    AccessDataStruct,
    #[strum(serialize = "bf_assoc_addresses_with_func")]
    AssocAddressesWithFunc,
    #[strum(serialize = "bf_assoc_addresses_with_prog")]
    AssocAddressesWithProg,
    #[strum(serialize = "bf_assoc_addresses_with_sstruct")]
    AssocAddressesWithSstruct,
    #[strum(serialize = "bf_assoc_addresses_with_dstruct")]
    AssocAddressesWithDstruct,
    #[strum(serialize = "bf_assoc_addresses_with_dstruct_pm")]
    AssocAddressesWithDstructPm,
    #[strum(serialize = "bf_assoc_addresses_with_dstruct_stack")]
    AssocAddressesWithDstructStack,
    #[strum(serialize = "bf_disassoc_addresses_with_dstruct")]
    DisassocAddressesWithDstruct,
    #[strum(serialize = "bf_reuse_dist_addrs_prog")]
    ReuseDistAddrsProg,
    #[strum(serialize = "bf_touch_cache")]
    TouchCache,
    #[strum(serialize = "bf_track_stride")]
    TrackStride,
    #[strum(serialize = "bf_record_funcs2keys")]
    RecordFuncs2Keys,
    #[strum(serialize = "bf_enter_inner_loop")]
    EnterInnerLoop,
    #[strum(serialize = "bf_exit_inner_loop")]
    ExitInnerLoop,
    #[strum(serialize = "llvm.memset.p0.i64")]
    Memset,
}

impl Routine {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Declaration of the routine. Every routine returns `void`.
    ///
    /// Function keys are `i32`, sizes and tallies `i64`, flags `i1`, and
    /// addresses, strings and symbol records are pointers.
    pub fn declaration(&self, registry: &TypeRegistry) -> ExternalFunction {
        let (i1, i8, i32, i64, ptr) = (
            registry.int(1),
            registry.int(8),
            registry.int(32),
            registry.int(64),
            registry.ptr(),
        );
        let param_types = match self {
            Routine::InitializeIfNecessary
            | Routine::ReportBbTallies
            | Routine::ResetBbTallies
            | Routine::PopFunction
            | Routine::AcquireMegaLock
            | Routine::ReleaseMegaLock => vec![],
            Routine::AccumulateBbTallies => vec![i64],
            Routine::AssocCountersWithFunc | Routine::IncrFuncTally => vec![i32],
            Routine::PushFunction => vec![ptr, i32],
            Routine::TallyVectorOperation => vec![ptr, i64, i64, i1],
            Routine::AccessDataStruct => vec![ptr, i64, i1],
            Routine::AssocAddressesWithFunc => vec![i32, ptr, i64],
            Routine::AssocAddressesWithProg
            | Routine::ReuseDistAddrsProg
            | Routine::TouchCache => vec![ptr, i64],
            Routine::AssocAddressesWithSstruct | Routine::AssocAddressesWithDstructStack => {
                vec![ptr, ptr, i64]
            }
            Routine::AssocAddressesWithDstruct => vec![ptr, ptr, ptr, i64],
            Routine::AssocAddressesWithDstructPm => vec![ptr, ptr, i64, i64],
            Routine::DisassocAddressesWithDstruct => vec![ptr],
            Routine::TrackStride => vec![ptr, ptr, i64, i1],
            Routine::RecordFuncs2Keys => vec![i32, ptr, ptr],
            Routine::EnterInnerLoop | Routine::ExitInnerLoop => vec![ptr],
            Routine::Memset => vec![ptr, i8, i64, i1],
        };

        ExternalFunction {
            name: self.name().to_string(),
            param_types,
            return_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn routine_names_belong_to_the_runtime() {
        for routine in Routine::iter() {
            let name = routine.name();
            assert!(
                is_runtime_symbol(name) || name == MEMSET_INTRINSIC,
                "unexpected routine name {}",
                name
            );
        }
        assert_eq!(Routine::AccumulateBbTallies.name(), "bf_accumulate_bb_tallies");
        assert_eq!(Routine::Memset.name(), MEMSET_INTRINSIC);
    }

    #[test]
    fn declarations_are_void() {
        let registry = TypeRegistry::new();
        let decl = Routine::TrackStride.declaration(&registry);
        assert_eq!(decl.name, "bf_track_stride");
        assert_eq!(decl.param_types.len(), 4);
        assert!(decl.return_type.is_none());
    }
}
