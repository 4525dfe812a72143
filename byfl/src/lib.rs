//! Static bytes/flops instrumentation for `byinstr` modules.
//!
//! [`pass::instrument_module`] rewrites a module so that, when it runs, it
//! reports its own loads, stores, flops, operation mix and memory behavior to
//! a runtime library. The pass only adds observation code: it never removes
//! or reorders existing instructions.
//!
//! ```
//! use byfl::{pass::instrument_module, symbols::DebugInfoResolver, utils::conf::InstrumentOptions};
//! use byinstr::{builder::FunctionBuilder, modules::Module, types::TypeRegistry};
//!
//! let registry = TypeRegistry::new();
//! let i64_ty = registry.int(64);
//! let mut b = FunctionBuilder::new(&registry, "double", &[i64_ty], Some(i64_ty));
//! let x = b.param(0);
//! let twice = b.iadd(i64_ty, x.clone(), x);
//! b.ret(Some(twice));
//!
//! let mut module = Module::new("demo");
//! module.functions.push(b.finish());
//!
//! let summary = instrument_module(
//!     &mut module,
//!     &registry,
//!     &InstrumentOptions::default(),
//!     &DebugInfoResolver,
//! )
//! .unwrap();
//! assert_eq!(summary.static_ops, 2);
//! assert!(module.global("bf_op_count").is_some());
//! ```

pub mod classify;
pub mod counters;
pub mod filter;
pub mod inject;
pub mod keys;
pub mod loops;
pub mod magic;
pub mod pass;
pub mod summary;
pub mod symbols;
pub mod utils;
