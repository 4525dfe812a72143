//! Instruction classification.
//!
//! A pure decision function: given an instruction and the types of the
//! values it reads, decide what it is for counting purposes. Nothing here
//! emits code.
use std::collections::BTreeMap;

use byinstr::{
    consts::AnyConst,
    modules::{
        Function, Instruction,
        instructions::{Instr, Opcode},
        misc::{Call, CastOp},
        operand::{Name, Operand},
        terminator::{Terminator, TerminatorKind},
    },
    types::{
        AnyType, TypeRegistry, Typeref,
        primary::{PrimaryBasicType, PrimaryType},
    },
    utils::Error,
};
use strum::{EnumCount, EnumIs, EnumIter};

use crate::symbols::definition;

/// Number of entries of the instruction-mix histogram: instruction opcodes
/// followed by terminator kinds.
pub const NUM_OPCODES: usize = Opcode::COUNT + TerminatorKind::COUNT;

/// Intrinsics that produce no machine code.
const IGNORABLE_PREFIXES: [&str; 2] = ["llvm.dbg.", "llvm.lifetime."];
const IGNORABLE_CALLS: [&str; 1] = ["llvm.assume"];

/// Math routines whose calls count as flops.
const MATH_ROUTINES: [&str; 14] = [
    "sqrt", "sin", "cos", "tan", "exp", "exp2", "log", "log2", "log10", "pow", "fabs", "fma",
    "floor", "ceil",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs, EnumIter, EnumCount)]
pub enum InstKind {
    Load,
    Store,
    Call,
    Invoke,
    Alloca,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Classification {
    pub kind: InstKind,
    /// Produces no machine work (bit-preserving casts, phis, markers).
    pub is_no_op: bool,
    /// Floating-point arithmetic. Memory traffic of fp values is not.
    pub is_fp: bool,
    /// Bits consumed plus bits produced.
    pub bit_width: u64,
    /// Lanes processed, `1` for scalars.
    pub vector_length: u64,
}

/// How a basic block ends, as reported to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum BlockEnd {
    /// Flush in the middle of a block.
    NotEnd = 0,
    Unconditional = 1,
    Conditional = 2,
}

impl BlockEnd {
    pub fn of(terminator: &Terminator) -> Self {
        if terminator.is_conditional() {
            BlockEnd::Conditional
        } else {
            BlockEnd::Unconditional
        }
    }

    /// Value passed to `bf_accumulate_bb_tallies`.
    pub fn code(self) -> u64 {
        self as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemIntrinsic {
    Set,
    Copy,
    Move,
}

impl MemIntrinsic {
    /// Returns true if the intrinsic reads a source buffer.
    pub fn reads(self) -> bool {
        !matches!(self, MemIntrinsic::Set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Allocator {
    Malloc,
    Calloc,
    Realloc,
    /// `posix_memalign(memptr, alignment, size)`, returning the block through
    /// `memptr`.
    PosixMemalign,
    Free,
}

/// Type information needed to classify the instructions of one function.
pub struct TypeContext<'a> {
    pub registry: &'a TypeRegistry,
    pub values: &'a BTreeMap<Name, Typeref>,
    pub function: &'a str,
}

impl<'a> TypeContext<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        values: &'a BTreeMap<Name, Typeref>,
        function: &'a str,
    ) -> Self {
        Self {
            registry,
            values,
            function,
        }
    }

    /// Type of `operand`. An unknown register is malformed input.
    pub fn operand_type(&self, operand: &Operand) -> Result<Typeref, Error> {
        operand
            .type_of(self.values, self.registry)
            .ok_or_else(|| Error::UntypedOperand {
                function: self.function.to_string(),
                operand: operand.to_string(),
            })
    }

    fn bit_width<'o>(
        &self,
        operands: impl Iterator<Item = &'o Operand>,
        result: Option<Typeref>,
    ) -> Result<u64, Error> {
        let mut bits = 0;
        for operand in operands {
            bits += self.registry.primitive_bits(self.operand_type(operand)?);
        }
        Ok(bits + result.map_or(0, |ty| self.registry.primitive_bits(ty)))
    }
}

/// Number of lanes of `ty`: the element count of a fixed vector, the
/// minimum element count of a scalable one, `scalar_default` otherwise.
pub fn vector_length(registry: &TypeRegistry, ty: Typeref, scalar_default: u64) -> u64 {
    match registry.vector_shape(ty) {
        Some(vc) => vc.size.min_elements() as u64,
        None => scalar_default,
    }
}

pub fn is_ignorable_call(name: &str) -> bool {
    IGNORABLE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        || IGNORABLE_CALLS.contains(&name)
}

/// `sqrt`, `sqrtf` and `llvm.sqrt.f64` all name the same math routine.
pub fn is_math_routine(name: &str) -> bool {
    let base = match name.strip_prefix("llvm.") {
        Some(rest) => rest.split('.').next().unwrap_or(rest),
        None => name
            .strip_suffix('f')
            .filter(|base| MATH_ROUTINES.contains(base))
            .unwrap_or(name),
    };
    MATH_ROUTINES.contains(&base)
}

pub fn memory_intrinsic(name: &str) -> Option<MemIntrinsic> {
    let base = name.strip_prefix("llvm.").unwrap_or(name);
    match base.split('.').next() {
        Some("memset") => Some(MemIntrinsic::Set),
        Some("memcpy") => Some(MemIntrinsic::Copy),
        Some("memmove") => Some(MemIntrinsic::Move),
        _ => None,
    }
}

/// Heap allocation routines, including the C++ `new`/`delete` operators.
pub fn allocator(name: &str) -> Option<Allocator> {
    match name {
        "malloc" | "_Znwm" | "_Znam" => Some(Allocator::Malloc),
        "calloc" => Some(Allocator::Calloc),
        "realloc" => Some(Allocator::Realloc),
        "posix_memalign" => Some(Allocator::PosixMemalign),
        "free" | "_ZdlPv" | "_ZdaPv" => Some(Allocator::Free),
        _ => None,
    }
}

/// Histogram index of a terminator kind. Terminators follow the instruction opcodes.
pub fn terminator_index(kind: TerminatorKind) -> usize {
    Opcode::COUNT + kind.index()
}

/// Mnemonics of every histogram index.
pub fn opcode_names() -> Vec<&'static str> {
    use strum::IntoEnumIterator;
    Opcode::iter()
        .map(|op| op.opname())
        .chain(TerminatorKind::iter().map(|kind| kind.opname()))
        .collect()
}

fn is_int_of_width(registry: &TypeRegistry, ty: Typeref, bits: u32) -> bool {
    matches!(
        registry.lookup(ty),
        Some(AnyType::Primary(PrimaryType::Int(itype))) if itype.num_bits() == bits
    )
}

fn call_is_fp(call: &Call, registry: &TypeRegistry) -> bool {
    call.callee().is_some_and(is_math_routine)
        && call.ty.is_some_and(|ty| registry.is_fp_or_fp_vector(ty))
}

pub fn classify(instr: &Instr, cx: &TypeContext) -> Result<Classification, Error> {
    let registry = cx.registry;
    let result = instr.destination_type(registry);
    let bit_width = cx.bit_width(instr.operands(), result)?;

    let kind = match instr {
        Instr::MLoad(_) => InstKind::Load,
        Instr::MStore(_) => InstKind::Store,
        Instr::Call(_) => InstKind::Call,
        Instr::MAlloca(_) => InstKind::Alloca,
        _ => InstKind::Other,
    };

    let is_no_op = match instr {
        Instr::Phi(_) => true,
        Instr::Cast(cast) => match cast.op {
            CastOp::Bitcast => true,
            CastOp::PtrToInt => is_int_of_width(registry, cast.to_ty, 64),
            CastOp::IntToPtr => is_int_of_width(registry, cast.from_ty, 64),
            _ => false,
        },
        Instr::Call(call) => call.callee().is_some_and(is_ignorable_call),
        _ => false,
    };

    let is_fp = match instr {
        Instr::FAdd(_)
        | Instr::FSub(_)
        | Instr::FMul(_)
        | Instr::FDiv(_)
        | Instr::FRem(_)
        | Instr::FNeg(_) => result.is_some_and(|ty| registry.is_fp_or_fp_vector(ty)),
        Instr::FCmp(cmp) => registry.is_fp_or_fp_vector(cmp.ty),
        Instr::Call(call) => call_is_fp(call, registry),
        _ => false,
    };

    let shape = match (instr, result) {
        (Instr::MStore(store), _) => Some(store.ty),
        (_, Some(ty)) => Some(ty),
        (_, None) => instr
            .operands()
            .next()
            .map(|op| cx.operand_type(op))
            .transpose()?,
    };
    let vector_length = shape.map_or(1, |ty| vector_length(registry, ty, 1));

    Ok(Classification {
        kind,
        is_no_op,
        is_fp,
        bit_width,
        vector_length,
    })
}

pub fn classify_terminator(
    terminator: &Terminator,
    cx: &TypeContext,
) -> Result<Classification, Error> {
    let registry = cx.registry;
    let result = terminator.destination_type();
    let bit_width = cx.bit_width(terminator.operands(), result)?;

    let (kind, is_fp) = match terminator {
        Terminator::Invoke(invoke) => (InstKind::Invoke, call_is_fp(&invoke.call, registry)),
        _ => (InstKind::Other, false),
    };

    Ok(Classification {
        kind,
        is_no_op: false,
        is_fp,
        bit_width,
        vector_length: result.map_or(1, |ty| vector_length(registry, ty, 1)),
    })
}

/// Element width and lane count of the first vector among `types`.
pub fn vector_operation(registry: &TypeRegistry, types: &[Typeref]) -> Option<(u64, u64)> {
    types.iter().find_map(|ty| {
        registry.vector_shape(*ty).map(|vc| {
            let element_bits = match vc.ty {
                PrimaryBasicType::Ptr(_) => 0,
                elem => elem.num_bits() as u64,
            };
            (vc.size.min_elements() as u64, element_bits)
        })
    })
}

/// An address is constant when it is a global, or a `gep` with a constant
/// base and immediate indices. Casts are looked through; loads, phis and
/// calls are not.
pub fn is_constant_address(function: &Function, addr: &Operand) -> bool {
    fn walk(function: &Function, addr: &Operand, depth: usize) -> bool {
        if depth == 0 {
            return false;
        }
        match addr {
            Operand::Global(_) | Operand::Imm(AnyConst::GlobalAddr(_)) => true,
            Operand::Reg(name) => match definition(function, *name) {
                Some(Instr::Cast(cast)) => walk(function, &cast.value, depth - 1),
                Some(Instr::MGetElementPtr(gep)) => {
                    gep.indices.iter().all(Operand::is_imm) && walk(function, &gep.base, depth - 1)
                }
                _ => false,
            },
            _ => false,
        }
    }
    walk(function, addr, function.instructions().count() + 1)
}

#[cfg(test)]
mod tests {
    use byinstr::{
        builder::FunctionBuilder,
        modules::{
            fp::{FAdd, FCmp, FCmpOp},
            int::{IAdd, ICmp, ICmpOp},
            mem::MLoad,
            misc::{Cast, Phi},
            operand::Label,
            terminator::{CBranch, Jump, Ret},
        },
        types::primary::{FType, IType},
    };

    use super::*;

    fn values(entries: &[(u32, Typeref)]) -> BTreeMap<Name, Typeref> {
        entries.iter().map(|(n, ty)| (Name(*n), *ty)).collect()
    }

    #[test]
    fn integer_add_widths() {
        let reg = TypeRegistry::new();
        let i32_ty = reg.int(32);
        let v4 = reg.vector(IType::I32, 4);
        let vals = values(&[(0, i32_ty), (1, v4)]);
        let cx = TypeContext::new(&reg, &vals, "f");

        let scalar: Instr = IAdd {
            dest: Name(2),
            ty: i32_ty,
            lhs: Name(0).into(),
            rhs: AnyConst::i32(1).into(),
        }
        .into();
        let c = classify(&scalar, &cx).unwrap();
        assert_eq!(c.bit_width, 96);
        assert_eq!(c.kind, InstKind::Other);
        assert!(!c.is_fp && !c.is_no_op);
        assert_eq!(c.vector_length, 1);

        let vector: Instr = IAdd {
            dest: Name(3),
            ty: v4,
            lhs: Name(1).into(),
            rhs: Name(1).into(),
        }
        .into();
        let c = classify(&vector, &cx).unwrap();
        assert_eq!(c.bit_width, 384);
        assert_eq!(c.vector_length, 4);
    }

    #[test]
    fn comparisons_yield_one_bit() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let f64_ty = reg.float(FType::Fp64);
        let vals = values(&[(0, i64_ty), (1, f64_ty)]);
        let cx = TypeContext::new(&reg, &vals, "f");

        let icmp: Instr = ICmp {
            dest: Name(2),
            ty: i64_ty,
            op: ICmpOp::Eq,
            lhs: Name(0).into(),
            rhs: Name(0).into(),
        }
        .into();
        assert_eq!(classify(&icmp, &cx).unwrap().bit_width, 129);

        let fcmp: Instr = FCmp {
            dest: Name(3),
            ty: f64_ty,
            op: FCmpOp::Olt,
            lhs: Name(1).into(),
            rhs: Name(1).into(),
        }
        .into();
        let c = classify(&fcmp, &cx).unwrap();
        assert!(c.is_fp);
        assert_eq!(c.bit_width, 129);
    }

    #[test]
    fn fp_loads_are_not_flops_and_pointers_are_free() {
        let reg = TypeRegistry::new();
        let f64_ty = reg.float(FType::Fp64);
        let vals = values(&[(0, reg.ptr()), (1, f64_ty)]);
        let cx = TypeContext::new(&reg, &vals, "f");

        let load: Instr = MLoad {
            dest: Name(2),
            ty: f64_ty,
            addr: Name(0).into(),
            alignment: None,
            volatile: false,
        }
        .into();
        let c = classify(&load, &cx).unwrap();
        assert_eq!(c.kind, InstKind::Load);
        assert!(!c.is_fp);
        assert_eq!(c.bit_width, 64);

        let add: Instr = FAdd {
            dest: Name(3),
            ty: f64_ty,
            lhs: Name(1).into(),
            rhs: Name(1).into(),
        }
        .into();
        assert!(classify(&add, &cx).unwrap().is_fp);
    }

    #[test]
    fn no_ops() {
        let reg = TypeRegistry::new();
        let (i32_ty, i64_ty, ptr) = (reg.int(32), reg.int(64), reg.ptr());
        let vals = values(&[(0, ptr), (1, i64_ty)]);
        let cx = TypeContext::new(&reg, &vals, "f");

        let cast = |dest, op, from_ty, to_ty, value: u32| -> Instr {
            Cast {
                dest: Name(dest),
                op,
                from_ty,
                to_ty,
                value: Name(value).into(),
            }
            .into()
        };
        let no_op = |instr: &Instr| classify(instr, &cx).unwrap().is_no_op;

        assert!(no_op(&cast(2, CastOp::PtrToInt, ptr, i64_ty, 0)));
        assert!(!no_op(&cast(3, CastOp::PtrToInt, ptr, i32_ty, 0)));
        assert!(no_op(&cast(4, CastOp::IntToPtr, i64_ty, ptr, 1)));
        assert!(no_op(&cast(5, CastOp::Bitcast, ptr, ptr, 0)));
        assert!(!no_op(&cast(6, CastOp::Trunc, i64_ty, i32_ty, 1)));

        let phi: Instr = Phi {
            dest: Name(7),
            ty: i64_ty,
            values: vec![(Label::NIL, Name(1).into())],
        }
        .into();
        assert!(no_op(&phi));

        let dbg: Instr = Call {
            dest: None,
            ty: None,
            function: Operand::Function("llvm.dbg.value".to_string()),
            args: vec![Name(1).into()],
        }
        .into();
        let c = classify(&dbg, &cx).unwrap();
        assert!(c.is_no_op);
        assert_eq!(c.kind, InstKind::Call);
        assert_eq!(c.bit_width, 64);
    }

    #[test]
    fn math_calls_are_flops() {
        let reg = TypeRegistry::new();
        let f64_ty = reg.float(FType::Fp64);
        let vals = values(&[(0, f64_ty)]);
        let cx = TypeContext::new(&reg, &vals, "f");

        for name in ["sqrt", "sqrtf", "llvm.sqrt.f64", "exp2f", "llvm.fma.v4f32"] {
            assert!(is_math_routine(name), "{}", name);
        }
        for name in ["sqrtl", "printf", "f", "llvm.memcpy.p0.p0.i64"] {
            assert!(!is_math_routine(name), "{}", name);
        }

        let call: Instr = Call {
            dest: Some(Name(1)),
            ty: Some(f64_ty),
            function: Operand::Function("sqrt".to_string()),
            args: vec![Name(0).into()],
        }
        .into();
        let c = classify(&call, &cx).unwrap();
        assert!(c.is_fp);
        assert_eq!(c.bit_width, 128);
    }

    #[test]
    fn undefined_operands_are_malformed_input() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let vals = BTreeMap::new();
        let cx = TypeContext::new(&reg, &vals, "broken");

        let add: Instr = IAdd {
            dest: Name(1),
            ty: i64_ty,
            lhs: Name(0).into(),
            rhs: Name(0).into(),
        }
        .into();
        assert!(matches!(
            classify(&add, &cx),
            Err(Error::UntypedOperand { ref function, .. }) if function == "broken"
        ));
    }

    #[test]
    fn terminators_classify_by_end_kind() {
        let reg = TypeRegistry::new();
        let vals = values(&[(0, reg.int(1))]);
        let cx = TypeContext::new(&reg, &vals, "f");

        let branch: Terminator = CBranch {
            cond: Name(0).into(),
            target_true: Label(1),
            target_false: Label(2),
        }
        .into();
        let jump: Terminator = Jump { target: Label(1) }.into();
        let ret: Terminator = Ret { value: None }.into();

        assert_eq!(BlockEnd::of(&branch), BlockEnd::Conditional);
        assert_eq!(BlockEnd::of(&jump), BlockEnd::Unconditional);
        assert_eq!(BlockEnd::of(&ret).code(), 1);
        assert_eq!(classify_terminator(&branch, &cx).unwrap().bit_width, 1);
        assert_eq!(classify_terminator(&jump, &cx).unwrap().kind, InstKind::Other);
        assert_eq!(terminator_index(TerminatorKind::Jump), Opcode::COUNT);
        assert_eq!(opcode_names().len(), NUM_OPCODES);
    }

    #[test]
    fn constant_addresses_follow_geps_and_casts() {
        let reg = TypeRegistry::new();
        let i64_ty = reg.int(64);
        let arr = reg.array(i64_ty, 4);
        let mut b = FunctionBuilder::new(&reg, "f", &[i64_ty], None);
        let i = b.param(0);
        let fixed = b.gep(
            arr,
            Operand::Global("table".to_string()),
            vec![AnyConst::i64(0).into(), AnyConst::i64(1).into()],
        );
        let cast = b.cast(CastOp::Bitcast, reg.ptr(), reg.ptr(), fixed.clone());
        let indexed = b.gep(
            arr,
            Operand::Global("table".to_string()),
            vec![AnyConst::i64(0).into(), i],
        );
        let loaded = b.load(reg.ptr(), cast.clone());
        b.ret(None);
        let func = b.finish();

        assert!(is_constant_address(&func, &Operand::Global("table".to_string())));
        assert!(is_constant_address(&func, &fixed));
        assert!(is_constant_address(&func, &cast));
        assert!(!is_constant_address(&func, &indexed));
        assert!(!is_constant_address(&func, &loaded));
    }

    #[test]
    fn intrinsic_and_allocator_names() {
        assert_eq!(memory_intrinsic("memcpy"), Some(MemIntrinsic::Copy));
        assert_eq!(
            memory_intrinsic("llvm.memmove.p0.p0.i64"),
            Some(MemIntrinsic::Move)
        );
        assert_eq!(memory_intrinsic("llvm.memset.p0.i64"), Some(MemIntrinsic::Set));
        assert_eq!(memory_intrinsic("memset_s"), None);
        assert!(is_ignorable_call("llvm.lifetime.start.p0"));
        assert!(!is_ignorable_call("llvm.sqrt.f64"));
        assert_eq!(allocator("calloc"), Some(Allocator::Calloc));
        assert_eq!(allocator("posix_memalign"), Some(Allocator::PosixMemalign));
        assert_eq!(allocator("mallocx"), None);
    }
}
