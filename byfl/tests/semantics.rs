mod common;

use byfl::{
    counters::ScalarCounter,
    pass::instrument_module,
    symbols::DebugInfoResolver,
    utils::conf::{InstrumentOptions, ReuseDistanceMode},
};
use byinstr::{interp::Value, types::TypeRegistry};

fn everything() -> InstrumentOptions {
    InstrumentOptions {
        every_bb: true,
        call_stack: true,
        unique_bytes: true,
        mem_footprint: true,
        data_structs: true,
        types: true,
        inst_mix: true,
        inst_deps: true,
        vectors: true,
        reuse_distance: vec![ReuseDistanceMode::Both],
        cache_model: true,
        strides: true,
        inner_loops: true,
        ..Default::default()
    }
}

fn program_trace(run: &common::Run) -> Vec<String> {
    run.recorder
        .program_calls()
        .into_iter()
        .map(|(name, _)| name.clone())
        .collect()
}

#[test]
fn instrumentation_preserves_results_and_external_calls() {
    let registry = TypeRegistry::new();
    let original = common::dot_module(&registry);
    let baseline = common::run_main(&original, &registry);
    assert_eq!(baseline.result, Some(Value::Float(24.0)));

    for options in [
        InstrumentOptions::default(),
        InstrumentOptions {
            merge_bb: 5,
            ..Default::default()
        },
        everything(),
        InstrumentOptions {
            thread_safe: true,
            ..everything()
        },
    ] {
        let mut module = original.clone();
        instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
        module.check().unwrap();

        let run = common::run_main(&module, &registry);
        assert_eq!(run.result, baseline.result, "{}", options.describe());
        assert_eq!(run.recorder.printed, baseline.recorder.printed);
        assert_eq!(program_trace(&run), program_trace(&baseline));
    }
}

#[test]
fn per_function_counts_are_exact() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        by_function: true,
        ..Default::default()
    };
    instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
    let run = common::run_main(&module, &registry);

    let n = common::LENGTH;
    assert_eq!(run.total(ScalarCounter::LoadInsts), 2 * n);
    assert_eq!(run.total(ScalarCounter::Loads), 2 * n * 8);
    assert_eq!(run.total(ScalarCounter::StoreInsts), 2 * n);
    assert_eq!(run.total(ScalarCounter::Stores), 2 * n * 8);
    assert_eq!(run.total(ScalarCounter::Flops), 2 * n);
    assert_eq!(run.total(ScalarCounter::Calls), 8);
    // dot: 1 + 2 * (n + 1) + 8 * n + 1, fill: 2 * (1 + 5 * n + 1), main: 9.
    assert_eq!(run.total(ScalarCounter::Ops), 177);
    assert!(run.residual.values().all(|value| *value == 0));
}

#[test]
fn call_stack_pushes_and_pops_balance() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        call_stack: true,
        ..Default::default()
    };
    instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
    let run = common::run_main(&module, &registry);

    assert_eq!(run.recorder.runtime_calls("bf_push_function"), 4);
    assert_eq!(run.recorder.runtime_calls("bf_pop_function"), 4);
    assert_eq!(run.recorder.runtime_calls("bf_initialize_if_necessary"), 4);
}

#[test]
fn inner_loops_report_entries_and_exits() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        inner_loops: true,
        ..Default::default()
    };
    let summary = instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
    assert_eq!(summary.inner_loops.len(), 2);

    let run = common::run_main(&module, &registry);
    // One loop in dot and one in each of the two fill calls.
    assert_eq!(run.recorder.runtime_calls("bf_enter_inner_loop"), 3);
    assert_eq!(run.recorder.runtime_calls("bf_exit_inner_loop"), 3);
}
