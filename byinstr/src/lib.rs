pub mod builder;
pub mod cfg;
pub mod consts;
#[cfg(any(test, feature = "test-utils"))]
pub mod interp;
pub mod modules;
pub mod types;
pub mod utils;
