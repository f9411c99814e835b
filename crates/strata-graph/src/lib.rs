// SPDX-License-Identifier: MIT OR Apache-2.0
//! Element graph loading, dependency scopes, and deterministic traversal.
//!
//! Elements are declarative build units owned by an [`ElementGraph`];
//! dependency edges are non-owning id references. The graph is a DAG —
//! cycles are a load error reported with the full path — and traversal is
//! deterministic given declaration order.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod element;
mod graph;
mod load;

pub use element::{Element, ElementId, Scope, SourceDecl};
pub use graph::ElementGraph;
pub use load::{GraphBuilder, Project, load_project};
