// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact metadata.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strata_keys::CacheKey;

/// Metadata embedded in every stored artifact.
///
/// The strong key recorded here is the one that was effective when the
/// build ran; non-strict sessions recover it from weak-key matches instead
/// of recomputing from current sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// The element this artifact was built from.
    pub element: String,
    /// Strong cache key effective at build time.
    pub strong_key: CacheKey,
    /// Weak cache key of the element at build time.
    pub weak_key: CacheKey,
    /// Digest of the artifact's file tree in the CAS.
    pub tree: String,
}

/// A handle onto a locally cached artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The artifact's metadata.
    pub meta: ArtifactMeta,
    /// Absolute path of the artifact's file tree inside the CAS.
    pub tree_path: PathBuf,
}

impl Artifact {
    /// The strong key embedded at build time.
    pub fn embedded_strong_key(&self) -> &CacheKey {
        &self.meta.strong_key
    }
}
