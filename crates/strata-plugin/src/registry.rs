// SPDX-License-Identifier: MIT OR Apache-2.0
//! The plugin registry.
//!
//! Kinds are registered at startup and looked up by name; registration is
//! last-wins so embedders can shadow a built-in with their own
//! implementation.

use crate::{ElementKind, SourceFactory};
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_error::{LoadError, LoadErrorReason};

/// Maps kind identifiers to compiled-in plugin implementations.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    sources: BTreeMap<String, Arc<dyn SourceFactory>>,
    elements: BTreeMap<String, Arc<dyn ElementKind>>,
}

impl PluginRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source kind.
    pub fn register_source(&mut self, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(factory.kind().to_owned(), factory);
    }

    /// Register an element kind.
    pub fn register_element(&mut self, kind: Arc<dyn ElementKind>) {
        self.elements.insert(kind.kind().to_owned(), kind);
    }

    /// Look up a source kind.
    pub fn source(&self, kind: &str) -> Result<Arc<dyn SourceFactory>, LoadError> {
        self.sources.get(kind).cloned().ok_or_else(|| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("unknown source kind '{kind}'"),
            )
        })
    }

    /// Look up an element kind.
    pub fn element(&self, kind: &str) -> Result<Arc<dyn ElementKind>, LoadError> {
        self.elements.get(kind).cloned().ok_or_else(|| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("unknown element kind '{kind}'"),
            )
        })
    }

    /// The registered source kind names.
    pub fn source_kinds(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// The registered element kind names.
    pub fn element_kinds(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("elements", &self.elements.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin_registry;

    #[test]
    fn builtins_are_registered() {
        let registry = builtin_registry();
        assert!(registry.source("local").is_ok());
        assert!(registry.source("static").is_ok());
        assert!(registry.element("import").is_ok());
        assert!(registry.element("manual").is_ok());
    }

    #[test]
    fn unknown_kinds_are_load_errors() {
        let registry = PluginRegistry::new();
        let err = match registry.element("alien") {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.reason, LoadErrorReason::InvalidData);
        assert!(err.message.contains("alien"));
    }

    #[test]
    fn kind_listing_is_sorted() {
        let registry = builtin_registry();
        let kinds: Vec<&str> = registry.element_kinds().collect();
        let mut sorted = kinds.clone();
        sorted.sort_unstable();
        assert_eq!(kinds, sorted);
    }
}
