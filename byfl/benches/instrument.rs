use criterion::{Criterion, black_box, criterion_group, criterion_main};

use byfl::{
    pass::instrument_module_with_ids,
    symbols::{DebugInfoResolver, SequentialIds},
    utils::conf::{InstrumentOptions, ReuseDistanceMode},
};
use byinstr::{
    builder::FunctionBuilder,
    consts::AnyConst,
    modules::{
        Linkage, Module,
        int::ICmpOp,
        operand::{Label, Operand},
        symbol::GlobalVariable,
    },
    types::{TypeRegistry, primary::FType},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A module of `functions` functions, each a forward-branching chain of
/// `blocks` blocks mixing integer and fp arithmetic with memory accesses.
fn random_module(registry: &TypeRegistry, functions: usize, blocks: usize) -> Module {
    let mut rng = ChaCha20Rng::seed_from_u64(0x42);
    let (i64_ty, f64_ty) = (registry.int(64), registry.float(FType::Fp64));
    let table_ty = registry.array(f64_ty, 64);

    let mut module = Module::new("bench");
    module.declare_global(GlobalVariable::new(
        "table",
        table_ty,
        AnyConst::Zero(table_ty),
        Linkage::Internal,
    ));

    for f in 0..functions {
        let mut b = FunctionBuilder::new(registry, format!("f{}", f), &[i64_ty, f64_ty], Some(i64_ty));
        let (x, y) = (b.param(0), b.param(1));
        let labels: Vec<Label> = (1..blocks).map(|_| b.new_block()).collect();

        let mut current = Label::NIL;
        for i in 0..blocks {
            b.switch_to(current);
            let mut int = x.clone();
            let mut fp = y.clone();
            for _ in 0..rng.random_range(2..8) {
                match rng.random_range(0..4) {
                    0 => int = b.iadd(i64_ty, int, AnyConst::i64(rng.random_range(1..100)).into()),
                    1 => fp = b.fmul(f64_ty, fp.clone(), fp),
                    2 => {
                        let index: Operand = AnyConst::i64(rng.random_range(0..64)).into();
                        let slot = b.gep(
                            table_ty,
                            Operand::Global("table".to_string()),
                            vec![AnyConst::i64(0).into(), index],
                        );
                        fp = b.load(f64_ty, slot);
                    }
                    _ => {
                        let slot = b.gep(
                            table_ty,
                            Operand::Global("table".to_string()),
                            vec![AnyConst::i64(0).into(), int.clone()],
                        );
                        b.store(f64_ty, fp.clone(), slot);
                    }
                }
            }

            if i + 1 == blocks {
                b.ret(Some(x.clone()));
            } else if i + 2 < blocks && rng.random_bool(0.5) {
                let cond = b.icmp(ICmpOp::Ult, i64_ty, int, x.clone());
                b.branch(cond, labels[i], labels[i + 1]);
            } else {
                b.jump(labels[i]);
            }
            if let Some(next) = labels.get(i) {
                current = *next;
            }
        }
        module.functions.push(b.finish());
    }
    module
}

fn bench_instrument(c: &mut Criterion) {
    let registry = TypeRegistry::new();
    let module = random_module(&registry, 32, 24);

    let configurations = [
        ("instrument_default", InstrumentOptions::default()),
        (
            "instrument_merged",
            InstrumentOptions {
                merge_bb: 8,
                by_function: true,
                ..Default::default()
            },
        ),
        (
            "instrument_everything",
            InstrumentOptions {
                call_stack: true,
                data_structs: true,
                types: true,
                inst_mix: true,
                inst_deps: true,
                vectors: true,
                reuse_distance: vec![ReuseDistanceMode::Both],
                cache_model: true,
                strides: true,
                inner_loops: true,
                thread_safe: true,
                ..Default::default()
            },
        ),
    ];

    for (name, options) in configurations {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut copy = module.clone();
                let mut ids = SequentialIds::default();
                let summary =
                    instrument_module_with_ids(&mut copy, &registry, &options, &DebugInfoResolver, &mut ids);
                black_box(summary.map(|summary| summary.static_ops).ok());
            })
        });
    }
}

criterion_group!(benches, bench_instrument);
criterion_main!(benches);
