// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin contracts: sources, element kinds, and the sandbox.
//!
//! The scheduler consumes plugins only through the traits defined here.
//! Plugins are compiled-in trait objects registered at startup; there is no
//! runtime code loading. Plugin failures are typed transient vs permanent —
//! the scheduler may retry transient ones.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builtin;
mod registry;
mod sandbox;

pub use builtin::builtin_registry;
pub use registry::PluginRegistry;
pub use sandbox::{CommandOutput, LocalSandbox, NullSandbox, Sandbox, SandboxCommand};

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use strata_error::{ElementError, LoadError};
use strata_node::Node;

// ---------------------------------------------------------------------------
// Plugin errors
// ---------------------------------------------------------------------------

/// A failure raised by a source or element plugin.
///
/// `transient` failures (network hiccups, mirror timeouts) may be retried
/// by the scheduler; permanent ones propagate immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    /// Short human-readable message.
    pub message: String,
    /// Optional detail block (e.g. captured command output).
    pub detail: Option<String>,
    /// Whether retrying could plausibly succeed.
    pub transient: bool,
}

impl PluginError {
    /// A permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            transient: false,
        }
    }

    /// A transient failure, eligible for retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            transient: true,
        }
    }

    /// Attach a detail block (builder style).
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Convert into the element error delivered to the scheduler.
    pub fn into_element_error(self, element: &str) -> ElementError {
        let mut err = ElementError::new(element, self.message);
        if let Some(detail) = self.detail {
            err = err.with_detail(detail);
        }
        if self.transient {
            err = err.retriable();
        }
        err
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        // Local I/O failures are not retriable by default.
        Self::permanent(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Ambient context handed to source instances at creation.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// The project root directory (for project-relative paths).
    pub project_dir: PathBuf,
    /// The per-source content cache directory.
    pub sources_dir: PathBuf,
}

/// An instantiated source: one entry of an element's `sources` list.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable digest of the source's pinned content.
    ///
    /// Only valid for pinned sources; contributes to the owning element's
    /// cache keys.
    fn unique_key(&self) -> Result<String, PluginError>;

    /// Whether the source is pinned to an exact version.
    ///
    /// Sources without a ref concept (local files) are always pinned.
    fn is_pinned(&self) -> bool;

    /// Whether the pinned content is already present locally.
    ///
    /// Synchronous: queue status probes consult this on every tick.
    fn is_cached(&self) -> Result<bool, PluginError>;

    /// Resolve a new ref for an unpinned source (`source track`).
    ///
    /// Returns `None` when the source has nothing to track.
    async fn track(&self) -> Result<Option<String>, PluginError>;

    /// Download the pinned content into the local source cache.
    async fn fetch(&self) -> Result<(), PluginError>;

    /// Materialise the source content into a sandbox root.
    async fn stage(&self, into: &Path) -> Result<(), PluginError>;
}

/// Factory creating [`Source`] instances for one source kind.
pub trait SourceFactory: Send + Sync {
    /// The source kind identifier (`local`, `static`, `tar`, …).
    fn kind(&self) -> &str;

    /// Instantiate a source from its configuration mapping.
    fn create(&self, config: &Node, context: &SourceContext)
    -> Result<Box<dyn Source>, LoadError>;
}

// ---------------------------------------------------------------------------
// Element kinds
// ---------------------------------------------------------------------------

/// Everything an element kind needs to assemble an artifact.
#[derive(Debug)]
pub struct BuildContext {
    /// The element's project-qualified name.
    pub element_name: String,
    /// The element's expanded configuration block.
    pub config: Node,
    /// Resolved build environment.
    pub environment: std::collections::BTreeMap<String, String>,
    /// Directory where sources have been staged.
    pub build_root: PathBuf,
    /// Directory the plugin must populate with its output.
    pub install_root: PathBuf,
    /// Effective parallel job count.
    pub max_jobs: u32,
}

/// A compiled-in element kind plugin.
#[async_trait]
pub trait ElementKind: Send + Sync {
    /// The kind identifier (`import`, `manual`, …).
    fn kind(&self) -> &str;

    /// Stable digest of the kind-specific configuration.
    ///
    /// Contributes to the owning element's cache keys; unrelated
    /// configuration changes must not perturb it.
    fn unique_key(&self, config: &Node) -> Result<String, PluginError>;

    /// Validate the element's configuration block at load time.
    fn configure(&self, config: &Node) -> Result<(), LoadError>;

    /// Run the build inside the sandbox, populating
    /// [`install_root`](BuildContext::install_root).
    async fn assemble(
        &self,
        sandbox: &dyn Sandbox,
        context: &BuildContext,
    ) -> Result<(), PluginError>;

    /// Commands to run when this element's artifact is staged into another
    /// element's sandbox.
    fn integration_commands(&self, public: &Node) -> Result<Vec<String>, LoadError> {
        match public.get_node("integration") {
            Some(integration) => integration.get_str_list_or_empty("commands"),
            None => Ok(Vec::new()),
        }
    }
}
