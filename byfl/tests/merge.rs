mod common;

use byfl::{
    counters::ScalarCounter,
    pass::instrument_module,
    symbols::DebugInfoResolver,
    utils::conf::InstrumentOptions,
};
use byinstr::types::TypeRegistry;
use strum::IntoEnumIterator;

fn run_with(registry: &TypeRegistry, merge_bb: u64) -> common::Run {
    let mut module = common::dot_module(registry);
    let options = InstrumentOptions {
        by_function: true,
        merge_bb,
        ..Default::default()
    };
    instrument_module(&mut module, registry, &options, &DebugInfoResolver).unwrap();
    common::run_main(&module, registry)
}

#[test]
fn merged_flushes_add_up_to_per_block_flushes() {
    let registry = TypeRegistry::new();
    let every_block = run_with(&registry, 1);
    let every_third = run_with(&registry, 3);

    for counter in ScalarCounter::iter() {
        assert_eq!(
            every_third.total(counter),
            every_block.total(counter),
            "{}",
            counter.global_name()
        );
    }
    assert!(
        every_third.recorder.runtime_calls("bf_accumulate_bb_tallies")
            < every_block.recorder.runtime_calls("bf_accumulate_bb_tallies")
    );
}

#[test]
fn merge_counter_is_published() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        merge_bb: 3,
        ..Default::default()
    };
    instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();

    assert!(module.global("bf_bb_merge_count").is_some());
    assert_eq!(
        module.global("bf_bb_merge").unwrap().init,
        Some(byinstr::consts::AnyConst::i64(3))
    );
}
