// SPDX-License-Identifier: MIT OR Apache-2.0
//! The remote cache client seam.
//!
//! The scheduler only depends on content-addressed pull/push by key. A
//! pull miss is `Ok(None)`, never an error; transient failures surface as
//! [`RemoteUnreachable`](CacheErrorReason::RemoteUnreachable) so the
//! scheduler can retry or degrade them to warnings.

use crate::artifact::ArtifactMeta;
use crate::store::LocalCas;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use strata_error::{CacheError, CacheErrorReason};
use strata_keys::CacheKey;
use tracing::debug;

/// An artifact fetched from a remote, not yet in the local store.
#[derive(Debug)]
pub struct PulledArtifact {
    /// The artifact's metadata as stored remotely.
    pub meta: ArtifactMeta,
    /// Directory holding the pulled tree; deleted when dropped.
    pub tree: tempfile::TempDir,
}

/// A remote artifact cache.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Display form of the remote endpoint.
    fn url(&self) -> String;

    /// Fetch the artifact bound to `(element, key)`.
    ///
    /// A miss is `Ok(None)`.
    async fn pull(
        &self,
        element: &str,
        key: &CacheKey,
    ) -> Result<Option<PulledArtifact>, CacheError>;

    /// Publish an artifact under both of its keys.
    async fn push(
        &self,
        meta: &ArtifactMeta,
        tree: &Path,
    ) -> Result<(), CacheError>;
}

// ---------------------------------------------------------------------------
// Directory-backed remote
// ---------------------------------------------------------------------------

/// A remote cache backed by a filesystem directory.
///
/// Covers shared caches on network mounts and doubles as the test double
/// for the remote protocol; the layout mirrors the local store.
#[derive(Debug)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    /// Address a remote at `root`. The directory must already exist —
    /// an absent directory is reported as unreachable on use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn store(&self) -> Result<LocalCas, CacheError> {
        if !self.root.is_dir() {
            return Err(CacheError::new(
                CacheErrorReason::RemoteUnreachable,
                format!("remote cache '{}' is not reachable", self.root.display()),
            ));
        }
        LocalCas::open(&self.root)
    }
}

#[async_trait]
impl RemoteCache for DirectoryRemote {
    fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn pull(
        &self,
        element: &str,
        key: &CacheKey,
    ) -> Result<Option<PulledArtifact>, CacheError> {
        let store = self.store()?;
        let Some(artifact) = store.lookup(element, key)? else {
            debug!(target: "strata.cas", element, key = %key.brief(), "remote miss");
            return Ok(None);
        };
        let tree = tempfile::tempdir().map_err(|err| {
            CacheError::new(
                CacheErrorReason::RemoteUnreachable,
                format!("staging pulled artifact: {err}"),
            )
        })?;
        store.checkout(&artifact, tree.path())?;
        Ok(Some(PulledArtifact {
            meta: artifact.meta,
            tree,
        }))
    }

    async fn push(&self, meta: &ArtifactMeta, tree: &Path) -> Result<(), CacheError> {
        let store = self.store()?;
        store.commit(
            &meta.element,
            &meta.strong_key,
            &meta.weak_key,
            tree,
            None,
        )?;
        debug!(
            target: "strata.cas",
            element = %meta.element,
            key = %meta.strong_key.brief(),
            "pushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: &str) -> CacheKey {
        strata_keys::digest(&serde_json::json!({ "tag": tag }))
    }

    fn meta(element: &str) -> ArtifactMeta {
        ArtifactMeta {
            element: element.to_owned(),
            strong_key: key("strong"),
            weak_key: key("weak"),
            tree: String::new(),
        }
    }

    #[tokio::test]
    async fn push_then_pull_roundtrip() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemote::new(remote_dir.path());

        let content = tempfile::tempdir().unwrap();
        std::fs::write(content.path().join("out"), "bits").unwrap();

        remote.push(&meta("app.bst"), content.path()).await.unwrap();

        let pulled = remote
            .pull("app.bst", &key("strong"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.meta.strong_key, key("strong"));
        assert_eq!(
            std::fs::read_to_string(pulled.tree.path().join("out")).unwrap(),
            "bits"
        );

        // Pullable by the weak key as well.
        assert!(remote.pull("app.bst", &key("weak")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pull_miss_is_ok_none() {
        let remote_dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemote::new(remote_dir.path());
        assert!(remote.pull("app.bst", &key("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_remote_is_unreachable() {
        let remote = DirectoryRemote::new("/definitely/not/mounted");
        let err = remote.pull("app.bst", &key("x")).await.unwrap_err();
        assert_eq!(err.reason, CacheErrorReason::RemoteUnreachable);
    }
}
