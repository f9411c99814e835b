// SPDX-License-Identifier: MIT OR Apache-2.0
//! Composition of one document tree onto another.
//!
//! Mappings merge recursively; plain sequences clobber; the list directives
//! `(=)`, `(<)` and `(>)` replace, prepend to, and append to an existing
//! list. A directive mapping that lands on empty space is preserved verbatim
//! so a later composition can resolve it; any directive that survives the
//! final composition is a user error surfaced by
//! [`Node::assert_fully_composited`].

use crate::{Node, NodeKind, NodeValue};
use strata_error::{LoadError, LoadErrorReason};

/// Directive key: replace the target list.
pub const DIRECTIVE_REPLACE: &str = "(=)";
/// Directive key: prepend to the target list.
pub const DIRECTIVE_PREPEND: &str = "(<)";
/// Directive key: append to the target list.
pub const DIRECTIVE_APPEND: &str = "(>)";

fn is_directive_key(key: &str) -> bool {
    matches!(key, DIRECTIVE_REPLACE | DIRECTIVE_PREPEND | DIRECTIVE_APPEND)
}

fn illegal(node: &Node, message: impl Into<String>) -> LoadError {
    LoadError::new(LoadErrorReason::IllegalComposite, message)
        .with_provenance(node.provenance().to_string())
}

/// Whether `node` is a list-composition directive mapping.
///
/// # Errors
///
/// Mixing directive keys with ordinary keys in one mapping is an
/// [`IllegalComposite`](LoadErrorReason::IllegalComposite) error.
pub fn is_composite_list(node: &Node) -> Result<bool, LoadError> {
    let NodeValue::Mapping(map) = node.value() else {
        return Ok(false);
    };
    let mut directives = false;
    let mut plain = false;
    for key in map.keys() {
        if is_directive_key(key) {
            directives = true;
        } else {
            plain = true;
        }
    }
    if directives && plain {
        return Err(illegal(
            node,
            "list composition directives (=), (<), (>) cannot be mixed with other keys",
        ));
    }
    Ok(directives)
}

impl Node {
    /// Composite this mapping on top of `target`.
    ///
    /// Values in `self` take precedence. After the merge, every mapping
    /// touched by the override reports the override's provenance so errors
    /// point at the declaration that won.
    pub fn composite(&self, target: &mut Node) -> Result<(), LoadError> {
        self.as_mapping()?;
        target.as_mapping()?;
        composite_mapping(self, target)
    }

    /// Composite this mapping *under* `target`: values already present in
    /// `target` take precedence over values in `self`.
    ///
    /// `b.composite(&mut a)` and `a.composite_under(&mut b)` produce
    /// value-identical results.
    pub fn composite_under(&self, target: &mut Node) -> Result<(), LoadError> {
        let mut base = self.clone();
        let overlay = target.clone();
        overlay.composite(&mut base)?;
        *target = base;
        Ok(())
    }

    /// Assert that no list-composition directive survived composition.
    ///
    /// A residual directive means the user amended a list that never
    /// existed.
    pub fn assert_fully_composited(&self) -> Result<(), LoadError> {
        assert_composited(self)
    }
}

fn assert_composited(node: &Node) -> Result<(), LoadError> {
    match node.value() {
        NodeValue::Mapping(map) => {
            for (key, child) in map {
                if is_composite_list(child)? {
                    return Err(LoadError::new(
                        LoadErrorReason::TrailingListDirective,
                        format!("list composition directive on '{key}', but no list named '{key}' exists"),
                    )
                    .with_provenance(child.provenance().to_string()));
                }
                assert_composited(child)?;
            }
            Ok(())
        }
        NodeValue::Sequence(seq) => {
            for child in seq {
                assert_composited(child)?;
            }
            Ok(())
        }
        NodeValue::Scalar(_) => Ok(()),
    }
}

fn composite_mapping(source: &Node, target: &mut Node) -> Result<(), LoadError> {
    // The override's declaration site wins for error reporting.
    target.set_provenance(source.provenance().clone());

    let source_map = source.as_mapping()?;
    for (key, src_child) in source_map {
        let src_is_directive =
            src_child.kind() == NodeKind::Mapping && is_composite_list(src_child)?;

        // Landing on empty space: sequences and scalars are cloned, directive
        // mappings are preserved verbatim for a later composition, plain
        // mappings are rebuilt recursively with the source's provenance.
        if !target.contains(key) {
            let node = if src_child.kind() == NodeKind::Mapping && !src_is_directive {
                let mut fresh = Node::mapping(src_child.provenance().clone());
                composite_mapping(src_child, &mut fresh)?;
                fresh
            } else {
                src_child.clone()
            };
            target.insert(key.as_str(), node)?;
            continue;
        }
        let Some(existing) = target.get_node_mut(key) else {
            continue;
        };

        match src_child.kind() {
            NodeKind::Sequence => composite_sequence_onto(key, src_child, existing)?,
            NodeKind::Mapping if src_is_directive => {
                composite_directives_onto(key, src_child, existing)?;
            }
            NodeKind::Mapping => composite_mapping_onto(key, src_child, existing)?,
            NodeKind::Scalar => composite_scalar_onto(key, src_child, existing)?,
        }
    }
    Ok(())
}

// A plain sequence always clobbers a list-shaped target; anything else in
// the way is an error.
fn composite_sequence_onto(key: &str, src: &Node, existing: &mut Node) -> Result<(), LoadError> {
    match existing.kind() {
        NodeKind::Sequence => {
            *existing = src.clone();
            Ok(())
        }
        NodeKind::Mapping if is_composite_list(existing)? => {
            *existing = src.clone();
            Ok(())
        }
        kind => Err(illegal(
            src,
            format!("cannot overwrite a {kind} at '{key}' with a list"),
        )),
    }
}

fn composite_directives_onto(key: &str, src: &Node, existing: &mut Node) -> Result<(), LoadError> {
    match existing.kind() {
        NodeKind::Sequence => apply_directives(src, existing),
        NodeKind::Mapping if is_composite_list(existing)? => merge_directives(src, existing),
        NodeKind::Mapping => Err(illegal(
            src,
            format!("list composition directives cannot be applied to the mapping at '{key}'"),
        )),
        NodeKind::Scalar => Err(illegal(
            src,
            format!("list composition directives cannot be applied to the scalar at '{key}'"),
        )),
    }
}

fn composite_mapping_onto(key: &str, src: &Node, existing: &mut Node) -> Result<(), LoadError> {
    match existing.kind() {
        NodeKind::Mapping if is_composite_list(existing)? => Err(illegal(
            src,
            format!("cannot compose a mapping onto the list directives at '{key}'"),
        )),
        NodeKind::Mapping => composite_mapping(src, existing),
        kind => Err(illegal(
            src,
            format!("cannot compose a mapping onto the {kind} at '{key}'"),
        )),
    }
}

fn composite_scalar_onto(key: &str, src: &Node, existing: &mut Node) -> Result<(), LoadError> {
    match existing.kind() {
        NodeKind::Scalar => {
            *existing = src.clone();
            Ok(())
        }
        kind => Err(illegal(
            src,
            format!("cannot overwrite the {kind} at '{key}' with a scalar"),
        )),
    }
}

// Resolve a directive mapping against a concrete list.
fn apply_directives(directives: &Node, target: &mut Node) -> Result<(), LoadError> {
    let mut out: Vec<Node> = Vec::new();
    if let Some(prepend) = directives.get_node(DIRECTIVE_PREPEND) {
        out.extend(prepend.as_sequence()?.iter().cloned());
    }
    match directives.get_node(DIRECTIVE_REPLACE) {
        Some(replace) => out.extend(replace.as_sequence()?.iter().cloned()),
        None => out.extend(target.as_sequence()?.iter().cloned()),
    }
    if let Some(append) = directives.get_node(DIRECTIVE_APPEND) {
        out.extend(append.as_sequence()?.iter().cloned());
    }
    *target = Node::sequence(out, directives.provenance().clone());
    Ok(())
}

// Combine two pending directive mappings so that applying the result equals
// applying `target`'s directives first and `src`'s second.
fn merge_directives(src: &Node, target: &mut Node) -> Result<(), LoadError> {
    if src.contains(DIRECTIVE_REPLACE) {
        // A replace discards everything the earlier directives would do.
        *target = src.clone();
        return Ok(());
    }

    let mut merged = Node::mapping(src.provenance().clone());

    let mut prepend: Vec<Node> = Vec::new();
    if let Some(p) = src.get_node(DIRECTIVE_PREPEND) {
        prepend.extend(p.as_sequence()?.iter().cloned());
    }
    if let Some(p) = target.get_node(DIRECTIVE_PREPEND) {
        prepend.extend(p.as_sequence()?.iter().cloned());
    }
    if !prepend.is_empty() {
        merged.insert(
            DIRECTIVE_PREPEND,
            Node::sequence(prepend, src.provenance().clone()),
        )?;
    }

    if let Some(replace) = target.get_node(DIRECTIVE_REPLACE) {
        merged.insert(DIRECTIVE_REPLACE, replace.clone())?;
    }

    let mut append: Vec<Node> = Vec::new();
    if let Some(a) = target.get_node(DIRECTIVE_APPEND) {
        append.extend(a.as_sequence()?.iter().cloned());
    }
    if let Some(a) = src.get_node(DIRECTIVE_APPEND) {
        append.extend(a.as_sequence()?.iter().cloned());
    }
    if !append.is_empty() {
        merged.insert(
            DIRECTIVE_APPEND,
            Node::sequence(append, src.provenance().clone()),
        )?;
    }

    *target = merged;
    Ok(())
}
