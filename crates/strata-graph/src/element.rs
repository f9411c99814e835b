// SPDX-License-Identifier: MIT OR Apache-2.0
//! The element model.
//!
//! An element is a declarative build unit: a kind, sources, dependencies,
//! and configuration. Elements are owned by the [`ElementGraph`]; dependency
//! edges are non-owning [`ElementId`] back-references.
//!
//! [`ElementGraph`]: crate::ElementGraph

use std::sync::OnceLock;
use strata_keys::{CacheKey, ElementKeyInputs, canonicalize};
use strata_node::{Node, Provenance};
use strata_vars::Variables;

/// Stable handle of an element within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

/// Dependency scope selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Dependencies needed in the sandbox to build the dependant.
    Build,
    /// Dependencies needed for the dependant to run.
    Run,
    /// The union of build and runtime dependencies.
    All,
}

/// A source declaration attached to an element.
///
/// Plugins interpret the configuration; the graph only records it together
/// with the pinned ref, if any.
#[derive(Debug, Clone)]
pub struct SourceDecl {
    /// Source kind identifier (`tar`, `git`, `local`, …).
    pub kind: String,
    /// The source's configuration mapping, ref included.
    pub config: Node,
    /// Where the source was declared.
    pub provenance: Provenance,
}

impl SourceDecl {
    /// The pinned ref, when present in the configuration.
    pub fn source_ref(&self) -> Option<String> {
        self.config.get_str_opt("ref").ok().flatten()
    }

    /// Whether this source is pinned to an exact version.
    pub fn is_pinned(&self) -> bool {
        self.source_ref().is_some()
    }
}

/// A declarative build unit.
#[derive(Debug)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) provenance: Provenance,
    pub(crate) config: Node,
    pub(crate) sources: Vec<SourceDecl>,
    pub(crate) build_deps: Vec<ElementId>,
    pub(crate) runtime_deps: Vec<ElementId>,
    pub(crate) variables: Variables,
    pub(crate) environment: Node,
    pub(crate) public: Node,
    pub(crate) sandbox: Node,
    weak_key: OnceLock<CacheKey>,
    strong_key: OnceLock<CacheKey>,
}

impl Element {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        kind: String,
        provenance: Provenance,
        config: Node,
        sources: Vec<SourceDecl>,
        variables: Variables,
        environment: Node,
        public: Node,
        sandbox: Node,
    ) -> Self {
        Self {
            name,
            kind,
            provenance,
            config,
            sources,
            build_deps: Vec::new(),
            runtime_deps: Vec::new(),
            variables,
            environment,
            public,
            sandbox,
            weak_key: OnceLock::new(),
            strong_key: OnceLock::new(),
        }
    }

    /// The element's project-qualified name (`dir/name.bst`, or
    /// `junction:dir/name.bst` across a junction).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element kind identifier.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Where the element was declared.
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// The kind plugin's configuration block.
    pub fn config(&self) -> &Node {
        &self.config
    }

    /// The element's source declarations, in order.
    pub fn sources(&self) -> &[SourceDecl] {
        &self.sources
    }

    /// Direct build dependencies, in declaration order.
    pub fn build_deps(&self) -> &[ElementId] {
        &self.build_deps
    }

    /// Direct runtime dependencies, in declaration order.
    pub fn runtime_deps(&self) -> &[ElementId] {
        &self.runtime_deps
    }

    /// The element's resolved variable environment.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// The composed build environment.
    pub fn environment(&self) -> &Node {
        &self.environment
    }

    /// Public data published by this element.
    pub fn public(&self) -> &Node {
        &self.public
    }

    /// The sandbox configuration block.
    pub fn sandbox(&self) -> &Node {
        &self.sandbox
    }

    // -- cache keys -----------------------------------------------------

    /// The weak cache key, once computed.
    pub fn weak_key(&self) -> Option<&CacheKey> {
        self.weak_key.get()
    }

    /// The strong cache key, once computed.
    pub fn strong_key(&self) -> Option<&CacheKey> {
        self.strong_key.get()
    }

    /// Record the weak key. The first assignment wins; keys never change
    /// within a session.
    pub fn set_weak_key(&self, key: CacheKey) {
        let _ = self.weak_key.set(key);
    }

    /// Record the strong key. The first assignment wins.
    pub fn set_strong_key(&self, key: CacheKey) {
        let _ = self.strong_key.set(key);
    }

    /// Assemble this element's own contribution to its cache keys.
    ///
    /// `source_keys` are the per-source unique keys obtained from the source
    /// plugins, in declaration order. Only the `integration` public-data
    /// domain participates; user-defined domains are excluded.
    pub fn key_inputs(
        &self,
        source_keys: Vec<String>,
        project_environment: serde_json::Value,
    ) -> Result<ElementKeyInputs, strata_error::LoadError> {
        let public_for_keys = match self.public.get_node("integration") {
            Some(integration) => canonicalize(integration),
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        let variables = serde_json::Value::Object(
            self.variables
                .resolved_pairs()?
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
        );
        Ok(ElementKeyInputs {
            kind: self.kind.clone(),
            config: canonicalize(&self.config),
            sources: source_keys,
            variables,
            environment: canonicalize(&self.environment),
            sandbox: canonicalize(&self.sandbox),
            public: public_for_keys,
            project_environment,
        })
    }
}
