// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic cache-key derivation.
//!
//! A cache key is the lowercase hex SHA-256 of a canonical JSON document:
//! mapping keys sorted lexicographically, sequences in declared order, every
//! scalar stringified, no floating point, no insignificant whitespace. The
//! weak key covers an element's own content plus the *names* of its build
//! dependencies; the strong key swaps the names for `(name, strong key)`
//! pairs covering each build dependency and its recursive runtime closure.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use strata_node::{Node, NodeValue};

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// A content-derived cache key: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-derived hex digest.
    ///
    /// Intended for keys read back from artifact metadata; no validation
    /// beyond shape is performed.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The full 64-character hex form.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// An abbreviated form for log lines.
    pub fn brief(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Canonical form
// ---------------------------------------------------------------------------

/// Convert a document node into its canonical JSON value.
///
/// All scalars become strings, null stays null. Mapping keys sort
/// lexicographically because the JSON object representation is a `BTreeMap`.
pub fn canonicalize(node: &Node) -> Value {
    match node.value() {
        NodeValue::Scalar(Some(text)) => Value::String(text.clone()),
        NodeValue::Scalar(None) => Value::Null,
        NodeValue::Sequence(children) => {
            Value::Array(children.iter().map(canonicalize).collect())
        }
        NodeValue::Mapping(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                out.insert(key.clone(), canonicalize(child));
            }
            Value::Object(out)
        }
    }
}

/// Serialise a canonical value to its compact byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    // Object keys are already sorted; compact encoding has no whitespace.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Lowercase hex SHA-256 of a canonical value.
pub fn digest(value: &Value) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(value));
    CacheKey(format!("{:x}", hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Element key material
// ---------------------------------------------------------------------------

/// Everything an element contributes to its own cache keys.
///
/// The per-field values are canonical JSON produced with [`canonicalize`]
/// from the element's fully composed and variable-expanded configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementKeyInputs {
    /// The element's kind identifier.
    pub kind: String,
    /// The kind plugin's own configuration digest input.
    pub config: Value,
    /// One unique key per source, in declaration order.
    pub sources: Vec<String>,
    /// Resolved variables.
    pub variables: Value,
    /// Build environment.
    pub environment: Value,
    /// Sandbox configuration block.
    pub sandbox: Value,
    /// Public data that participates in keys (the `integration` domain
    /// only; user-defined domains are excluded).
    pub public: Value,
    /// The project environment fragment relevant to this element.
    pub project_environment: Value,
}

/// A build dependency's contribution to a strong key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyContribution {
    /// Element name of the dependency (or runtime-closure member).
    pub name: String,
    /// That element's strong key.
    pub key: CacheKey,
}

impl ElementKeyInputs {
    fn common_material(&self) -> Map<String, Value> {
        let mut material = Map::new();
        material.insert("kind".into(), Value::String(self.kind.clone()));
        material.insert("config".into(), self.config.clone());
        material.insert(
            "sources".into(),
            Value::Array(self.sources.iter().cloned().map(Value::String).collect()),
        );
        material.insert("variables".into(), self.variables.clone());
        material.insert("environment".into(), self.environment.clone());
        material.insert("sandbox".into(), self.sandbox.clone());
        material.insert("public".into(), self.public.clone());
        material.insert("project-environment".into(), self.project_environment.clone());
        material
    }

    /// Derive the weak key from the sorted names of the build dependencies.
    pub fn weak_key(&self, build_dep_names: &[String]) -> CacheKey {
        let mut names: Vec<String> = build_dep_names.to_vec();
        names.sort();
        let mut material = self.common_material();
        material.insert(
            "build-deps".into(),
            Value::Array(names.into_iter().map(Value::String).collect()),
        );
        digest(&Value::Object(material))
    }

    /// Derive the strong key from `(name, strong key)` pairs covering every
    /// build dependency and each one's recursive runtime closure.
    ///
    /// With no build dependencies this is byte-identical to
    /// [`weak_key`](Self::weak_key) of an empty name list.
    pub fn strong_key(&self, build_deps: &[DependencyContribution]) -> CacheKey {
        let mut deps: Vec<&DependencyContribution> = build_deps.iter().collect();
        deps.sort_by(|a, b| a.name.cmp(&b.name));

        let mut material = self.common_material();
        if deps.is_empty() {
            // Keep the empty-list shape shared with the weak key so the two
            // coincide for dependency-free elements.
            material.insert("build-deps".into(), Value::Array(Vec::new()));
        } else {
            material.insert(
                "build-deps".into(),
                Value::Array(
                    deps.into_iter()
                        .map(|d| {
                            let mut pair = Map::new();
                            pair.insert("name".into(), Value::String(d.name.clone()));
                            pair.insert("key".into(), Value::String(d.key.as_hex().to_owned()));
                            Value::Object(pair)
                        })
                        .collect(),
                ),
            );
        }
        digest(&Value::Object(material))
    }
}
