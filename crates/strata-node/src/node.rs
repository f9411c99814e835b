// SPDX-License-Identifier: MIT OR Apache-2.0
//! The structured document node.
//!
//! A [`Node`] is a scalar, an insertion-ordered mapping, or a sequence, and
//! always carries [`Provenance`]. Typed accessors validate the node kind and
//! raise [`LoadError`]s that point back at the offending declaration; this
//! API has no any-typed escape hatch.

use crate::Provenance;
use indexmap::IndexMap;
use std::fmt;
use strata_error::{LoadError, LoadErrorReason};

/// The three document node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A string, integer, boolean, or null value.
    Scalar,
    /// An insertion-ordered mapping with string keys.
    Mapping,
    /// An ordered list of nodes.
    Sequence,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar => "scalar",
            Self::Mapping => "mapping",
            Self::Sequence => "sequence",
        })
    }
}

/// Value payload of a [`Node`].
#[derive(Debug, Clone)]
pub enum NodeValue {
    /// Scalar payload; `None` is null. The canonical internal form of all
    /// non-null scalars is a string.
    Scalar(Option<String>),
    /// Mapping payload, insertion-ordered.
    Mapping(IndexMap<String, Node>),
    /// Sequence payload.
    Sequence(Vec<Node>),
}

/// A provenance-tracked document node.
#[derive(Debug, Clone)]
pub struct Node {
    value: NodeValue,
    provenance: Provenance,
}

impl Node {
    // -- construction ---------------------------------------------------

    /// Create a scalar node holding a string value.
    pub fn scalar(value: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            value: NodeValue::Scalar(Some(value.into())),
            provenance,
        }
    }

    /// Create a null scalar node.
    pub fn null(provenance: Provenance) -> Self {
        Self {
            value: NodeValue::Scalar(None),
            provenance,
        }
    }

    /// Create an empty mapping node.
    pub fn mapping(provenance: Provenance) -> Self {
        Self {
            value: NodeValue::Mapping(IndexMap::new()),
            provenance,
        }
    }

    /// Create a sequence node from its children.
    pub fn sequence(children: Vec<Node>, provenance: Provenance) -> Self {
        Self {
            value: NodeValue::Sequence(children),
            provenance,
        }
    }

    /// Assemble a node from raw parts.
    pub fn from_value(value: NodeValue, provenance: Provenance) -> Self {
        Self { value, provenance }
    }

    // -- inspection -----------------------------------------------------

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        match self.value {
            NodeValue::Scalar(_) => NodeKind::Scalar,
            NodeValue::Mapping(_) => NodeKind::Mapping,
            NodeValue::Sequence(_) => NodeKind::Sequence,
        }
    }

    /// The node's provenance.
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Replace the node's provenance.
    ///
    /// Composition uses this to retarget merged mappings at the override's
    /// declaration site.
    pub fn set_provenance(&mut self, provenance: Provenance) {
        self.provenance = provenance;
    }

    /// Borrow the raw value payload.
    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    /// Whether this node is a null scalar.
    pub fn is_null(&self) -> bool {
        matches!(self.value, NodeValue::Scalar(None))
    }

    fn type_error(&self, expected: NodeKind) -> LoadError {
        LoadError::new(
            LoadErrorReason::InvalidData,
            format!("expected a {expected}, found a {}", self.kind()),
        )
        .with_provenance(self.provenance.to_string())
    }

    fn missing_key_error(&self, key: &str) -> LoadError {
        LoadError::new(
            LoadErrorReason::InvalidData,
            format!("missing required key '{key}'"),
        )
        .with_provenance(self.provenance.to_string())
    }

    // -- scalar access --------------------------------------------------

    /// The scalar string value.
    ///
    /// # Errors
    ///
    /// Fails when the node is not a scalar or is null.
    pub fn as_str(&self) -> Result<&str, LoadError> {
        match &self.value {
            NodeValue::Scalar(Some(s)) => Ok(s),
            NodeValue::Scalar(None) => Err(LoadError::new(
                LoadErrorReason::InvalidData,
                "expected a string, found null",
            )
            .with_provenance(self.provenance.to_string())),
            _ => Err(self.type_error(NodeKind::Scalar)),
        }
    }

    /// The scalar interpreted as a boolean.
    ///
    /// Accepts exactly `True`, `true`, `False`, and `false`.
    pub fn as_bool(&self) -> Result<bool, LoadError> {
        match self.as_str()? {
            "True" | "true" => Ok(true),
            "False" | "false" => Ok(false),
            other => Err(LoadError::new(
                LoadErrorReason::InvalidData,
                format!("expected a boolean, found '{other}'"),
            )
            .with_provenance(self.provenance.to_string())),
        }
    }

    /// The scalar interpreted as a signed integer.
    pub fn as_int(&self) -> Result<i64, LoadError> {
        let s = self.as_str()?;
        s.parse().map_err(|_| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("expected an integer, found '{s}'"),
            )
            .with_provenance(self.provenance.to_string())
        })
    }

    // -- mapping access -------------------------------------------------

    /// Borrow the mapping payload.
    pub fn as_mapping(&self) -> Result<&IndexMap<String, Node>, LoadError> {
        match &self.value {
            NodeValue::Mapping(map) => Ok(map),
            _ => Err(self.type_error(NodeKind::Mapping)),
        }
    }

    /// Mutably borrow the mapping payload.
    pub fn as_mapping_mut(&mut self) -> Result<&mut IndexMap<String, Node>, LoadError> {
        if !matches!(self.value, NodeValue::Mapping(_)) {
            return Err(LoadError::new(
                LoadErrorReason::InvalidData,
                format!("expected a mapping, found a {}", self.kind()),
            )
            .with_provenance(self.provenance.to_string()));
        }
        match &mut self.value {
            NodeValue::Mapping(map) => Ok(map),
            _ => unreachable!(),
        }
    }

    /// Borrow the sequence payload.
    pub fn as_sequence(&self) -> Result<&[Node], LoadError> {
        match &self.value {
            NodeValue::Sequence(seq) => Ok(seq),
            _ => Err(self.type_error(NodeKind::Sequence)),
        }
    }

    /// Look up a child node by key. Returns `None` for missing keys and for
    /// non-mapping nodes.
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        match &self.value {
            NodeValue::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up a child node by key, mutably.
    pub fn get_node_mut(&mut self, key: &str) -> Option<&mut Node> {
        match &mut self.value {
            NodeValue::Mapping(map) => map.get_mut(key),
            _ => None,
        }
    }

    /// Look up a required child node by key.
    pub fn require_node(&self, key: &str) -> Result<&Node, LoadError> {
        self.as_mapping()?
            .get(key)
            .ok_or_else(|| self.missing_key_error(key))
    }

    /// Look up a required child mapping.
    pub fn get_mapping(&self, key: &str) -> Result<&Node, LoadError> {
        let child = self.require_node(key)?;
        child.as_mapping()?;
        Ok(child)
    }

    /// Look up an optional child mapping.
    pub fn get_mapping_opt(&self, key: &str) -> Result<Option<&Node>, LoadError> {
        match self.get_node(key) {
            None => Ok(None),
            Some(child) => {
                child.as_mapping()?;
                Ok(Some(child))
            }
        }
    }

    /// Look up a required child sequence.
    pub fn get_sequence(&self, key: &str) -> Result<&[Node], LoadError> {
        self.require_node(key)?.as_sequence()
    }

    /// Look up an optional child sequence; a missing key yields an empty
    /// slice.
    pub fn get_sequence_or_empty(&self, key: &str) -> Result<&[Node], LoadError> {
        match self.get_node(key) {
            None => Ok(&[]),
            Some(child) => child.as_sequence(),
        }
    }

    /// Look up a required scalar child and return its string value.
    pub fn get_str(&self, key: &str) -> Result<String, LoadError> {
        Ok(self.require_node(key)?.as_str()?.to_owned())
    }

    /// Look up an optional scalar child.
    pub fn get_str_opt(&self, key: &str) -> Result<Option<String>, LoadError> {
        match self.get_node(key) {
            None => Ok(None),
            Some(child) => Ok(Some(child.as_str()?.to_owned())),
        }
    }

    /// Look up an optional scalar child with a default.
    pub fn get_str_or(&self, key: &str, default: &str) -> Result<String, LoadError> {
        Ok(self.get_str_opt(key)?.unwrap_or_else(|| default.to_owned()))
    }

    /// Look up a required boolean child.
    pub fn get_bool(&self, key: &str) -> Result<bool, LoadError> {
        self.require_node(key)?.as_bool()
    }

    /// Look up an optional boolean child with a default.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, LoadError> {
        match self.get_node(key) {
            None => Ok(default),
            Some(child) => child.as_bool(),
        }
    }

    /// Look up a required integer child.
    pub fn get_int(&self, key: &str) -> Result<i64, LoadError> {
        self.require_node(key)?.as_int()
    }

    /// Look up an optional integer child with a default.
    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64, LoadError> {
        match self.get_node(key) {
            None => Ok(default),
            Some(child) => child.as_int(),
        }
    }

    /// Look up a required sequence of scalars.
    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>, LoadError> {
        self.get_sequence(key)?
            .iter()
            .map(|n| n.as_str().map(str::to_owned))
            .collect()
    }

    /// Look up an optional sequence of scalars; a missing key yields an
    /// empty list.
    pub fn get_str_list_or_empty(&self, key: &str) -> Result<Vec<String>, LoadError> {
        self.get_sequence_or_empty(key)?
            .iter()
            .map(|n| n.as_str().map(str::to_owned))
            .collect()
    }

    /// Look up a scalar child constrained to a closed set of values.
    ///
    /// With `default = None` the key is required.
    pub fn get_enum(
        &self,
        key: &str,
        allowed: &[&str],
        default: Option<&str>,
    ) -> Result<String, LoadError> {
        let value = match (self.get_node(key), default) {
            (Some(child), _) => child.as_str()?.to_owned(),
            (None, Some(default)) => default.to_owned(),
            (None, None) => return Err(self.missing_key_error(key)),
        };
        if allowed.contains(&value.as_str()) {
            return Ok(value);
        }
        let child = self.get_node(key).unwrap_or(self);
        Err(LoadError::new(
            LoadErrorReason::InvalidData,
            format!(
                "'{value}' is not one of the allowed values: {}",
                allowed.join(", ")
            ),
        )
        .with_provenance(child.provenance().to_string()))
    }

    /// Insert a child into a mapping node.
    pub fn insert(&mut self, key: impl Into<String>, node: Node) -> Result<(), LoadError> {
        self.as_mapping_mut()?.insert(key.into(), node);
        Ok(())
    }

    /// Remove a child from a mapping node, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Node> {
        match &mut self.value {
            NodeValue::Mapping(map) => map.shift_remove(key),
            _ => None,
        }
    }

    /// Whether a mapping node contains the key.
    pub fn contains(&self, key: &str) -> bool {
        self.get_node(key).is_some()
    }

    /// Iterate over a mapping node's `(key, child)` pairs in insertion
    /// order. Empty for non-mapping nodes.
    pub fn items(&self) -> impl Iterator<Item = (&str, &Node)> {
        let map = match &self.value {
            NodeValue::Mapping(map) => Some(map),
            _ => None,
        };
        map.into_iter().flatten().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of children (mapping entries or sequence items); 0 for
    /// scalars.
    pub fn len(&self) -> usize {
        match &self.value {
            NodeValue::Scalar(_) => 0,
            NodeValue::Mapping(map) => map.len(),
            NodeValue::Sequence(seq) => seq.len(),
        }
    }

    /// Whether the node has no children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail on any key outside the allowed set.
    ///
    /// The error points at the unexpected key's value node.
    pub fn validate_keys(&self, allowed: &[&str]) -> Result<(), LoadError> {
        for (key, child) in self.items() {
            if !allowed.contains(&key) {
                return Err(LoadError::new(
                    LoadErrorReason::InvalidData,
                    format!("unexpected key '{key}'"),
                )
                .with_provenance(child.provenance().to_string()));
            }
        }
        Ok(())
    }

    // -- comparison -----------------------------------------------------

    /// Structural equality ignoring provenance.
    pub fn same_value(&self, other: &Node) -> bool {
        match (&self.value, &other.value) {
            (NodeValue::Scalar(a), NodeValue::Scalar(b)) => a == b,
            (NodeValue::Sequence(a), NodeValue::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (NodeValue::Mapping(a), NodeValue::Mapping(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, va), (kb, vb))| {
                        ka == kb && va.same_value(vb)
                    })
            }
            _ => false,
        }
    }
}
