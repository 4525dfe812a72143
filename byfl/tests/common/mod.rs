#![allow(dead_code)]

use std::collections::BTreeMap;

use byfl::{counters::ScalarCounter, magic::is_runtime_symbol};
use byinstr::{
    builder::FunctionBuilder,
    consts::AnyConst,
    interp::{ExternalHandler, ExternalOutcome, InterpError, Interpreter, Memory, Value},
    modules::{
        Module,
        fp::FAdd,
        int::{IAdd, ICmpOp},
        operand::{Label, Operand},
        symbol::ExternalFunction,
    },
    types::{TypeRegistry, primary::FType},
};
use strum::IntoEnumIterator;

/// Number of elements `main` works on.
pub const LENGTH: u64 = 8;

/// `dot(a, b, n)`, `fill(p, n, v)` and a `main` that fills two heap buffers
/// with 1.5 and 2.0, prints their dot product, frees them and returns it.
pub fn dot_module(registry: &TypeRegistry) -> Module {
    let (i64_ty, f64_ty, ptr) = (registry.int(64), registry.float(FType::Fp64), registry.ptr());
    let mut module = Module::new("dot");

    // dot(a, b, n)
    let mut b = FunctionBuilder::new(registry, "dot", &[ptr, ptr, i64_ty], Some(f64_ty));
    let (a, bv, n) = (b.param(0), b.param(1), b.param(2));
    let header = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();
    b.jump(header);

    b.switch_to(header);
    let (i, acc, i_next, acc_next) = (b.fresh(), b.fresh(), b.fresh(), b.fresh());
    b.phi_into(i, i64_ty, vec![(Label::NIL, AnyConst::i64(0).into()), (body, i_next.into())]);
    b.phi_into(acc, f64_ty, vec![(Label::NIL, AnyConst::f64(0.0).into()), (body, acc_next.into())]);
    let done = b.icmp(ICmpOp::Uge, i64_ty, i.into(), n);
    b.branch(done, exit, body);

    b.switch_to(body);
    let pa = b.gep(f64_ty, a, vec![i.into()]);
    let pb = b.gep(f64_ty, bv, vec![i.into()]);
    let x = b.load(f64_ty, pa);
    let y = b.load(f64_ty, pb);
    let prod = b.fmul(f64_ty, x, y);
    b.push(FAdd {
        dest: acc_next,
        ty: f64_ty,
        lhs: acc.into(),
        rhs: prod,
    });
    b.push(IAdd {
        dest: i_next,
        ty: i64_ty,
        lhs: i.into(),
        rhs: AnyConst::i64(1).into(),
    });
    b.jump(header);

    b.switch_to(exit);
    b.ret(Some(acc.into()));
    module.functions.push(b.finish());

    // fill(p, n, v)
    let mut b = FunctionBuilder::new(registry, "fill", &[ptr, i64_ty, f64_ty], None);
    let (p, n, v) = (b.param(0), b.param(1), b.param(2));
    let body = b.new_block();
    let exit = b.new_block();
    let (i, i_next) = (b.fresh(), b.fresh());
    b.jump(body);

    b.switch_to(body);
    b.phi_into(i, i64_ty, vec![(Label::NIL, AnyConst::i64(0).into()), (body, i_next.into())]);
    let slot = b.gep(f64_ty, p, vec![i.into()]);
    b.store(f64_ty, v, slot);
    b.push(IAdd {
        dest: i_next,
        ty: i64_ty,
        lhs: i.into(),
        rhs: AnyConst::i64(1).into(),
    });
    let more = b.icmp(ICmpOp::Ult, i64_ty, i_next.into(), n);
    b.branch(more, body, exit);

    b.switch_to(exit);
    b.ret(None);
    module.functions.push(b.finish());

    // main()
    let mut b = FunctionBuilder::new(registry, "main", &[], Some(f64_ty));
    let n: Operand = AnyConst::i64(LENGTH).into();
    let bytes: Operand = AnyConst::i64(LENGTH * 8).into();
    let lhs = b.call("malloc", Some(ptr), vec![bytes.clone()]).unwrap();
    let rhs = b.call("malloc", Some(ptr), vec![bytes]).unwrap();
    b.call("fill", None, vec![lhs.clone(), n.clone(), AnyConst::f64(1.5).into()]);
    b.call("fill", None, vec![rhs.clone(), n.clone(), AnyConst::f64(2.0).into()]);
    let result = b.call("dot", Some(f64_ty), vec![lhs.clone(), rhs.clone(), n]).unwrap();
    b.call("print", None, vec![result.clone()]);
    b.call("free", None, vec![lhs]);
    b.call("free", None, vec![rhs]);
    b.ret(Some(result));
    module.functions.push(b.finish());

    for (name, params, ret) in [
        ("malloc", vec![i64_ty], Some(ptr)),
        ("free", vec![ptr], None),
        ("print", vec![f64_ty], None),
    ] {
        module.declare_external(ExternalFunction {
            name: name.to_string(),
            param_types: params,
            return_type: ret,
        });
    }

    module.check().unwrap();
    module
}

/// Stand-in for the runtime library and libc.
///
/// Every `bf_*` routine is accepted and logged. At each
/// `bf_accumulate_bb_tallies` the current value of every scalar counter is
/// added to `totals`, which is what the runtime does with them.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRecorder {
    pub calls: Vec<(String, Vec<Value>)>,
    pub printed: Vec<f64>,
    pub totals: BTreeMap<&'static str, u64>,
    counters: Vec<(&'static str, u64)>,
    lock_depth: u32,
}

impl RuntimeRecorder {
    /// Calls to anything but the runtime.
    pub fn program_calls(&self) -> Vec<&(String, Vec<Value>)> {
        self.calls
            .iter()
            .filter(|(name, _)| !is_runtime_symbol(name))
            .collect()
    }

    pub fn runtime_calls(&self, routine: &str) -> usize {
        self.calls.iter().filter(|(name, _)| name == routine).count()
    }
}

impl ExternalHandler for RuntimeRecorder {
    fn call(
        &mut self,
        name: &str,
        args: &[Value],
        memory: &mut Memory,
    ) -> Result<ExternalOutcome, InterpError> {
        self.calls.push((name.to_string(), args.to_vec()));
        let arg = |i: usize| args.get(i).and_then(Value::as_u64).unwrap_or(0);

        let result = match name {
            "malloc" => Some(Value::Ptr(memory.allocate(arg(0)))),
            "free" => None,
            "print" => {
                self.printed
                    .extend(args.first().and_then(Value::as_f64));
                None
            }
            "bf_acquire_mega_lock" => {
                if self.lock_depth != 0 {
                    return Err(InterpError::Unsupported("nested mega lock".to_string()));
                }
                self.lock_depth += 1;
                None
            }
            "bf_release_mega_lock" => {
                if self.lock_depth != 1 {
                    return Err(InterpError::Unsupported("release without acquire".to_string()));
                }
                self.lock_depth -= 1;
                None
            }
            "bf_accumulate_bb_tallies" => {
                for (counter, addr) in &self.counters {
                    *self.totals.entry(*counter).or_default() += memory.read_u64(*addr)?;
                }
                None
            }
            other if is_runtime_symbol(other) => None,
            other => return Err(InterpError::UnknownFunction(other.to_string())),
        };
        Ok(ExternalOutcome::Return(result))
    }
}

/// Result of running `main`, with the recorder and the counter values left
/// over at exit.
pub struct Run {
    pub result: Option<Value>,
    pub recorder: RuntimeRecorder,
    pub residual: BTreeMap<&'static str, u64>,
}

impl Run {
    /// Accumulated plus not yet flushed value of a scalar counter.
    pub fn total(&self, counter: ScalarCounter) -> u64 {
        let name = counter.global_name();
        self.recorder.totals.get(name).copied().unwrap_or(0)
            + self.residual.get(name).copied().unwrap_or(0)
    }
}

/// Run the constructors and `main` of `module`.
pub fn run_main(module: &Module, registry: &TypeRegistry) -> Run {
    let mut interp = Interpreter::new(module, registry, RuntimeRecorder::default()).unwrap();
    let counters: Vec<_> = ScalarCounter::iter()
        .filter_map(|c| {
            interp
                .global_address(c.global_name())
                .map(|addr| (c.global_name(), addr))
        })
        .collect();
    interp.handler_mut().counters = counters.clone();

    interp.run_constructors().unwrap();
    let result = interp.call("main", &[]).unwrap();

    let residual = counters
        .iter()
        .map(|(name, _)| (*name, interp.read_global_u64(name, 0).unwrap()))
        .collect();
    Run {
        result,
        recorder: interp.handler().clone(),
        residual,
    }
}
