// SPDX-License-Identifier: MIT OR Apache-2.0
//! The local content-addressed store.
//!
//! On-disk layout under the cache directory:
//!
//! ```text
//! cas/<tree-digest>/…      artifact file trees, addressed by content
//! artifacts/<element>/<key>.json
//!                          cache-key → metadata bindings (strong and weak)
//! sources/<unique-key>/…   per-source staged content
//! logs/<element>/<key>.log per-build log files
//! tmp/                     staging area for atomic commits
//! ```
//!
//! Every write is staged under `tmp/` and renamed into place, so an
//! interrupted session never leaves a half-written blob visible. The
//! weak-key binding is replace-on-write: non-strict sessions always see
//! the latest matching build.

use crate::artifact::{Artifact, ArtifactMeta};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use strata_error::{CacheError, CacheErrorReason};
use strata_keys::CacheKey;
use tracing::debug;
use walkdir::WalkDir;

/// The local artifact cache.
#[derive(Debug)]
pub struct LocalCas {
    root: PathBuf,
    // The artifact index is mutated by exactly one task at a time.
    index_lock: Mutex<()>,
}

fn io_error(context: &str, err: impl std::fmt::Display) -> CacheError {
    CacheError::new(CacheErrorReason::CorruptBlob, format!("{context}: {err}"))
}

/// Digest a file tree: relative paths, file sizes, and file bytes in
/// sorted order.
pub fn tree_digest(root: &Path) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| io_error("walking tree", err))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| io_error("walking tree", err))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.file_type().is_file() {
            let bytes =
                std::fs::read(entry.path()).map_err(|err| io_error("reading tree", err))?;
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), CacheError> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|err| io_error("copying tree", err))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|err| io_error("copying tree", err))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|err| io_error("copying tree", err))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|err| io_error("copying tree", err))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|err| io_error("copying tree", err))?;
        }
    }
    Ok(())
}

impl LocalCas {
    /// Open (creating if needed) a cache at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        for sub in ["cas", "artifacts", "sources", "logs", "tmp"] {
            std::fs::create_dir_all(root.join(sub))
                .map_err(|err| io_error("creating cache directory", err))?;
        }
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn binding_path(&self, element: &str, key: &CacheKey) -> PathBuf {
        self.root
            .join("artifacts")
            .join(element)
            .join(format!("{}.json", key.as_hex()))
    }

    /// Whether an artifact is cached under `(element, key)`.
    pub fn contains(&self, element: &str, key: &CacheKey) -> bool {
        self.binding_path(element, key).is_file()
    }

    /// Open the artifact bound to `(element, key)`, if present.
    ///
    /// # Errors
    ///
    /// [`CorruptBlob`](CacheErrorReason::CorruptBlob) when the binding
    /// exists but the metadata or tree cannot be read;
    /// [`KeyMismatch`](CacheErrorReason::KeyMismatch) when the metadata
    /// does not mention the key it was fetched by.
    pub fn lookup(&self, element: &str, key: &CacheKey) -> Result<Option<Artifact>, CacheError> {
        let path = self.binding_path(element, key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|err| io_error("reading metadata", err))?;
        let meta: ArtifactMeta = serde_json::from_slice(&bytes)
            .map_err(|err| io_error("decoding metadata", err))?;
        if &meta.strong_key != key && &meta.weak_key != key {
            return Err(CacheError::new(
                CacheErrorReason::KeyMismatch,
                format!(
                    "artifact for '{element}' fetched by {} but embeds {} / {}",
                    key.brief(),
                    meta.strong_key.brief(),
                    meta.weak_key.brief()
                ),
            ));
        }
        let tree_path = self.root.join("cas").join(&meta.tree);
        if !tree_path.is_dir() {
            return Err(CacheError::new(
                CacheErrorReason::CorruptBlob,
                format!("artifact tree {} is missing from the CAS", meta.tree),
            ));
        }
        Ok(Some(Artifact { meta, tree_path }))
    }

    /// Store a file tree in the CAS, returning its digest.
    ///
    /// Storing the same content twice is idempotent.
    pub fn store_tree(&self, content: &Path) -> Result<String, CacheError> {
        let digest = tree_digest(content)?;
        let destination = self.root.join("cas").join(&digest);
        if destination.exists() {
            return Ok(digest);
        }
        let staging = tempfile::tempdir_in(self.root.join("tmp"))
            .map_err(|err| io_error("creating staging dir", err))?;
        let staged = staging.path().join("tree");
        copy_tree(content, &staged)?;
        match std::fs::rename(&staged, &destination) {
            Ok(()) => {}
            // A concurrent writer won the race; identical content either way.
            Err(_) if destination.exists() => {}
            Err(err) => return Err(io_error("committing tree", err)),
        }
        Ok(digest)
    }

    /// Commit a built artifact: store its tree, then bind the metadata
    /// under both the strong and the weak key.
    ///
    /// The weak binding is replace-on-write so the latest matching build
    /// wins for non-strict sessions.
    pub fn commit(
        &self,
        element: &str,
        strong_key: &CacheKey,
        weak_key: &CacheKey,
        content: &Path,
        log: Option<&str>,
    ) -> Result<Artifact, CacheError> {
        let tree = self.store_tree(content)?;
        let meta = ArtifactMeta {
            element: element.to_owned(),
            strong_key: strong_key.clone(),
            weak_key: weak_key.clone(),
            tree: tree.clone(),
        };

        let _guard = self.index_lock.lock().expect("artifact index lock poisoned");
        self.write_binding(element, strong_key, &meta)?;
        if weak_key != strong_key {
            self.write_binding(element, weak_key, &meta)?;
        }
        if let Some(log) = log {
            self.write_log(element, strong_key, log)?;
        }
        debug!(
            target: "strata.cas",
            element,
            strong = %strong_key.brief(),
            weak = %weak_key.brief(),
            "artifact committed"
        );
        Ok(Artifact {
            tree_path: self.root.join("cas").join(&tree),
            meta,
        })
    }

    fn write_binding(
        &self,
        element: &str,
        key: &CacheKey,
        meta: &ArtifactMeta,
    ) -> Result<(), CacheError> {
        let path = self.binding_path(element, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| io_error("creating binding dir", err))?;
        }
        let bytes =
            serde_json::to_vec(meta).map_err(|err| io_error("encoding metadata", err))?;
        let staged = tempfile::NamedTempFile::new_in(self.root.join("tmp"))
            .map_err(|err| io_error("staging metadata", err))?;
        std::fs::write(staged.path(), &bytes)
            .map_err(|err| io_error("staging metadata", err))?;
        staged
            .persist(&path)
            .map_err(|err| io_error("committing metadata", err))?;
        Ok(())
    }

    /// Materialise an artifact's tree at `into`.
    pub fn checkout(&self, artifact: &Artifact, into: &Path) -> Result<(), CacheError> {
        copy_tree(&artifact.tree_path, into)
    }

    // -- logs -----------------------------------------------------------

    /// Path of the build log for `(element, key)`.
    pub fn log_path(&self, element: &str, key: &CacheKey) -> PathBuf {
        self.root
            .join("logs")
            .join(element)
            .join(format!("{}.log", key.as_hex()))
    }

    /// Write (or replace) the build log for `(element, key)`.
    ///
    /// Also used for failed builds, whose logs are referenced from the
    /// session report.
    pub fn write_log(&self, element: &str, key: &CacheKey, log: &str) -> Result<(), CacheError> {
        let path = self.log_path(element, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| io_error("creating log dir", err))?;
        }
        std::fs::write(&path, log).map_err(|err| io_error("writing log", err))
    }

    /// Read back the build log for `(element, key)`, if one exists.
    pub fn read_log(&self, element: &str, key: &CacheKey) -> Option<String> {
        std::fs::read_to_string(self.log_path(element, key)).ok()
    }

    // -- sources --------------------------------------------------------

    /// Whether source content is cached under `unique_key`.
    pub fn contains_source(&self, unique_key: &str) -> bool {
        self.root.join("sources").join(unique_key).is_dir()
    }

    /// Store source content under its unique key, atomically.
    pub fn store_source(&self, unique_key: &str, content: &Path) -> Result<(), CacheError> {
        let destination = self.root.join("sources").join(unique_key);
        if destination.exists() {
            return Ok(());
        }
        let staging = tempfile::tempdir_in(self.root.join("tmp"))
            .map_err(|err| io_error("creating staging dir", err))?;
        let staged = staging.path().join("source");
        copy_tree(content, &staged)?;
        match std::fs::rename(&staged, &destination) {
            Ok(()) => Ok(()),
            Err(_) if destination.exists() => Ok(()),
            Err(err) => Err(io_error("committing source", err)),
        }
    }

    /// Path of the cached source content for `unique_key`.
    pub fn source_path(&self, unique_key: &str) -> PathBuf {
        self.root.join("sources").join(unique_key)
    }
}
