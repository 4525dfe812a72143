//! Aggregate types
//!
//! This file provides composite types built from `Typeref` references stored
//! in the central `TypeRegistry`:
//! - `ArrayType`: a fixed-size array of elements referenced by `Typeref`.
//! - `StructType`: a packed sequence of element `Typeref`s.
//!
//! Both types carry lightweight `fmt` helpers that accept a `&TypeRegistry` so
//! that elements can be resolved for display purposes.
use crate::types::{TypeRegistry, Typeref};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Array type
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArrayType {
    pub ty: Typeref,
    pub num_elements: u64,
}

impl ArrayType {
    /// Build a formatting helper for this `ArrayType`.
    pub fn fmt<'a>(&'a self, registry: &'a TypeRegistry) -> impl std::fmt::Display + 'a {
        struct ArrayTypeFmt<'a> {
            r#ref: &'a ArrayType,
            registry: &'a TypeRegistry,
        }

        impl std::fmt::Display for ArrayTypeFmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "[{} x {}]",
                    self.r#ref.num_elements,
                    self.registry.fmt(self.r#ref.ty)
                )
            }
        }

        ArrayTypeFmt {
            r#ref: self,
            registry,
        }
    }
}

/// Structure type. Elements are laid out back to back without padding.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StructType {
    pub element_types: Vec<Typeref>,
}

impl StructType {
    /// Build a formatting helper for this `StructType`.
    pub fn fmt<'a>(&'a self, registry: &'a TypeRegistry) -> impl std::fmt::Display + 'a {
        struct StructTypeFmt<'a> {
            r#ref: &'a StructType,
            registry: &'a TypeRegistry,
        }

        impl std::fmt::Display for StructTypeFmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{{ ")?;
                for (i, typeref) in self.r#ref.element_types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.registry.fmt(*typeref))?;
                }
                write!(f, " }}")
            }
        }

        StructTypeFmt {
            r#ref: self,
            registry,
        }
    }
}
