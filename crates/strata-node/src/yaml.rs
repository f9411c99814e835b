// SPDX-License-Identifier: MIT OR Apache-2.0
//! Loading YAML documents into provenance-tracked nodes.
//!
//! Parsing is delegated to `marked_yaml`, which retains per-node line and
//! column marks; this module converts its tree into [`Node`]s registered
//! against the session's [`FileRegistry`].

use crate::{FileId, FileRegistry, Node, Provenance};
use std::path::Path;
use strata_error::{LoadError, LoadErrorReason};

/// Parse a YAML document into a mapping node.
///
/// `name` is the display name used in provenance strings (typically the
/// project-relative path). An empty document yields an empty mapping.
///
/// # Errors
///
/// [`InvalidYaml`](LoadErrorReason::InvalidYaml) when the text does not
/// parse; [`InvalidData`](LoadErrorReason::InvalidData) when the top level
/// is not a mapping.
pub fn load_string(
    registry: &FileRegistry,
    name: &str,
    contents: &str,
) -> Result<Node, LoadError> {
    let file = registry.register(name);

    if contents.trim().is_empty() {
        return Ok(Node::mapping(registry.provenance(file, 1, 1)));
    }

    let parsed = marked_yaml::parse_yaml(file.0 as usize, contents).map_err(|err| {
        LoadError::new(LoadErrorReason::InvalidYaml, err.to_string()).with_provenance(name)
    })?;

    let root = convert(registry, file, &parsed);
    match root.kind() {
        crate::NodeKind::Mapping => Ok(root),
        kind => Err(LoadError::new(
            LoadErrorReason::InvalidData,
            format!("expected a mapping at the top level, found a {kind}"),
        )
        .with_provenance(root.provenance().to_string())),
    }
}

/// Load a YAML file from disk into a mapping node.
///
/// # Errors
///
/// [`MissingFile`](LoadErrorReason::MissingFile) when the path does not
/// exist, [`LoadingDirectory`](LoadErrorReason::LoadingDirectory) when it
/// is a directory, plus the parse errors of [`load_string`].
pub fn load_file(registry: &FileRegistry, path: &Path) -> Result<Node, LoadError> {
    let name = path.display().to_string();
    if path.is_dir() {
        return Err(LoadError::new(
            LoadErrorReason::LoadingDirectory,
            format!("expected a file, '{name}' is a directory"),
        ));
    }
    let contents = std::fs::read_to_string(path).map_err(|err| {
        let reason = if err.kind() == std::io::ErrorKind::NotFound {
            LoadErrorReason::MissingFile
        } else {
            LoadErrorReason::InvalidData
        };
        LoadError::new(reason, format!("could not read '{name}': {err}"))
    })?;
    load_string(registry, &name, &contents)
}

fn mark_provenance(
    registry: &FileRegistry,
    file: FileId,
    span: &marked_yaml::types::Span,
) -> Provenance {
    match span.start() {
        Some(marker) => registry.provenance(file, marker.line() as u32, marker.character() as u32),
        None => registry.provenance(file, 0, 0),
    }
}

fn convert(registry: &FileRegistry, file: FileId, node: &marked_yaml::types::Node) -> Node {
    match node {
        marked_yaml::types::Node::Scalar(scalar) => {
            let provenance = mark_provenance(registry, file, scalar.span());
            let text: &str = scalar;
            Node::scalar(text, provenance)
        }
        marked_yaml::types::Node::Sequence(sequence) => {
            let provenance = mark_provenance(registry, file, sequence.span());
            let children = sequence.iter().map(|c| convert(registry, file, c)).collect();
            Node::sequence(children, provenance)
        }
        marked_yaml::types::Node::Mapping(mapping) => {
            let provenance = mark_provenance(registry, file, mapping.span());
            let mut out = Node::mapping(provenance);
            for (key, value) in mapping.iter() {
                let key_text: &str = key;
                let converted = convert(registry, file, value);
                // Key insertion into a fresh mapping cannot fail.
                let _ = out.insert(key_text, converted);
            }
            out
        }
    }
}
