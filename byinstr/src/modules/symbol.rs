//! Module-level symbols: external function declarations and global variables.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    consts::AnyConst,
    modules::{DebugVariable, Linkage},
    types::Typeref,
};

/// A function referenced by the module but defined elsewhere.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExternalFunction {
    pub name: String,
    pub param_types: Vec<Typeref>,
    pub return_type: Option<Typeref>,
}

/// A global variable.
///
/// A global without initializer is a declaration of a variable defined in
/// another module.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Typeref,
    pub init: Option<AnyConst>,
    pub linkage: Linkage,
    pub constant: bool,
    pub debug: Option<DebugVariable>,
}

impl GlobalVariable {
    /// A mutable global defined by `init`.
    pub fn new(name: impl Into<String>, ty: Typeref, init: AnyConst, linkage: Linkage) -> Self {
        Self {
            name: name.into(),
            ty,
            init: Some(init),
            linkage,
            constant: false,
            debug: None,
        }
    }

    /// Mark the global as read-only.
    pub fn read_only(mut self) -> Self {
        self.constant = true;
        self
    }

    /// Returns true if the module defines the storage of this global.
    pub fn is_definition(&self) -> bool {
        self.init.is_some()
    }
}
