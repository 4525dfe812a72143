mod common;

use byfl::{
    pass::instrument_module,
    symbols::DebugInfoResolver,
    utils::{
        conf::InstrumentOptions,
        error::{ByflError, ConfigError},
    },
};
use byinstr::{
    modules::{Module, instructions::Instr},
    types::TypeRegistry,
};

fn calls_runtime(module: &Module, function: &str) -> bool {
    module
        .function(function)
        .unwrap()
        .instructions()
        .any(|instr| match instr {
            Instr::Call(call) => call.callee().is_some_and(|name| name.starts_with("bf_")),
            _ => false,
        })
}

#[test]
fn include_and_exclude_together_are_rejected() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let before = module.clone();
    let options = InstrumentOptions {
        include: vec!["main".to_string()],
        exclude: vec!["dot".to_string()],
        ..Default::default()
    };

    let err = instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap_err();
    assert!(matches!(
        err,
        ByflError::Config(ConfigError::IncludeAndExclude {
            include: 1,
            exclude: 1
        })
    ));
    assert_eq!(module, before);
}

#[test]
fn excluding_a_function_skips_only_that_function() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        exclude: vec!["fill".to_string()],
        ..Default::default()
    };

    let summary = instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
    assert_eq!(summary.instrumented_functions, 2);
    assert_eq!(summary.skipped_functions, 1);
    assert!(!calls_runtime(&module, "fill"));
    assert!(calls_runtime(&module, "dot"));
    assert!(calls_runtime(&module, "main"));

    // The skipped function still runs, it just reports nothing.
    let run = common::run_main(&module, &registry);
    assert_eq!(run.recorder.runtime_calls("bf_initialize_if_necessary"), 2);
}

#[test]
fn include_list_selects_functions() {
    let registry = TypeRegistry::new();
    let mut module = common::dot_module(&registry);
    let options = InstrumentOptions {
        include: vec!["dot".to_string()],
        ..Default::default()
    };

    let summary = instrument_module(&mut module, &registry, &options, &DebugInfoResolver).unwrap();
    assert_eq!(summary.instrumented_functions, 1);
    assert!(calls_runtime(&module, "dot"));
    assert!(!calls_runtime(&module, "fill"));
    assert!(!calls_runtime(&module, "main"));
}
