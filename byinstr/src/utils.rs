use strum::EnumIs;
use thiserror::Error;

use crate::{
    modules::operand::{Label, Name},
    types::Typeref,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, Error)]
pub enum Error {
    /// A name is defined more than once.
    #[error(
        "Multiple operations with shared destination target violate SSA requirements. The name `{duplicate}` is defined more than once within function `{function}`."
    )]
    DuplicateSSAName { function: String, duplicate: Name },

    /// No basic block with the entrypoint label was found.
    #[error(
        "By convention, the entrypoint basic block of a function must have label `block_0`. No such basic block was found in function `{function}`."
    )]
    MissingEntryBlock { function: String },

    /// An operand refers to an unresolved name.
    #[error(
        "An operand of function `{function}` refers to an undefined name: `{undefined}`. This name was never defined in the function."
    )]
    UndefinedSSAName { function: String, undefined: Name },

    /// The basic block referenced cannot be found within the function.
    #[error(
        "The basic block `{label}` referenced in function `{function}` is not defined within the function."
    )]
    UndefinedBasicBlock { function: String, label: Label },

    /// Phi instructions must be the first instructions of a basic block.
    #[error(
        "Phi instructions must be the first instructions in a basic block or follow other phi instructions. The basic block `{block}` of function `{function}` contains a phi instruction that is not the first instruction."
    )]
    PhiNotFirstInstruction { function: String, block: Label },

    /// Debug records of a function or global disagree with the code they describe.
    #[error("Inconsistent debug information in `{symbol}`: {reason}.")]
    InconsistentDebugInfo { symbol: String, reason: String },

    /// A typeref does not belong to the registry it was used with.
    #[error("The type reference `{0:?}` is not registered in the type registry.")]
    UnknownType(Typeref),

    /// The type of an operand cannot be determined.
    #[error(
        "The type of operand `{operand}` in function `{function}` cannot be determined from the function's definitions."
    )]
    UntypedOperand { function: String, operand: String },

    /// No function with the given name is defined in the module.
    #[error("No function named `{0}` is defined in the module.")]
    UndefinedFunction(String),

    /// The requested control-flow edge does not exist.
    #[error("Function `{function}` has no control-flow edge from `{from}` to `{to}`.")]
    UndefinedEdge {
        function: String,
        from: Label,
        to: Label,
    },

    /// An insertion point lies outside of the basic block.
    #[error(
        "Insertion point at instruction {index} lies outside of a basic block holding {len} instructions."
    )]
    InsertionOutOfBounds { index: usize, len: usize },

    /// A basic block with the given label already exists in the function.
    #[error("A basic block with label `{0}` already exists in the function.")]
    BlockLabelAlreadyExists(Label),
}
