// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provenance-tracked structured document model.
//!
//! This crate is the data substrate the rest of strata builds on: every
//! configuration value is a [`Node`] — a scalar, an insertion-ordered
//! mapping, or a sequence — tagged with the file, line, and column it was
//! declared at. Documents compose with the list directives `(=)`, `(<)`,
//! and `(>)`; typed accessors turn structural mistakes into load errors
//! that point at the offending declaration.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod composite;
mod node;
mod provenance;
mod yaml;

pub use composite::{
    DIRECTIVE_APPEND, DIRECTIVE_PREPEND, DIRECTIVE_REPLACE, is_composite_list,
};
pub use node::{Node, NodeKind, NodeValue};
pub use provenance::{FileId, FileRegistry, Provenance};
pub use yaml::{load_file, load_string};
