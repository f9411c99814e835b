//! Closed error taxonomy for the strata build orchestrator.
//!
//! Every user-visible failure is one of the variants of [`Error`]. Load-time
//! failures carry a [`LoadErrorReason`] sub-code and, where available, a
//! provenance string (`file [line L column C]`) pointing at the offending
//! declaration. Per-element failures raised by plugins carry a retriable
//! flag that drives the scheduler's retry policy.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Load errors
// ---------------------------------------------------------------------------

/// Machine-readable sub-code attached to every [`LoadError`].
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadErrorReason {
    /// A referenced file does not exist.
    MissingFile,
    /// A path expected to be a file is a directory.
    LoadingDirectory,
    /// The file is not valid YAML.
    InvalidYaml,
    /// The YAML is well-formed but structurally invalid (wrong type,
    /// missing key, unknown key).
    InvalidData,
    /// An element or variable name contains illegal characters.
    InvalidSymbolName,
    /// A `%{name}` reference points at a variable that is not defined.
    UnresolvedVariable,
    /// Variable resolution found a reference cycle.
    CircularReferenceVariable,
    /// A variable expands into itself through nested templates.
    RecursiveVariable,
    /// A composition directive was applied to an incompatible target.
    IllegalComposite,
    /// A list-composition directive survived to the end of composition,
    /// meaning it tried to amend a list that never existed.
    TrailingListDirective,
    /// The element dependency graph contains a cycle.
    CircularDependency,
}

impl LoadErrorReason {
    /// Stable string form of the sub-code (e.g. `"MISSING_FILE"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingFile => "MISSING_FILE",
            Self::LoadingDirectory => "LOADING_DIRECTORY",
            Self::InvalidYaml => "INVALID_YAML",
            Self::InvalidData => "INVALID_DATA",
            Self::InvalidSymbolName => "INVALID_SYMBOL_NAME",
            Self::UnresolvedVariable => "UNRESOLVED_VARIABLE",
            Self::CircularReferenceVariable => "CIRCULAR_REFERENCE_VARIABLE",
            Self::RecursiveVariable => "RECURSIVE_VARIABLE",
            Self::IllegalComposite => "ILLEGAL_COMPOSITE",
            Self::TrailingListDirective => "TRAILING_LIST_DIRECTIVE",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
        }
    }
}

impl fmt::Display for LoadErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised while loading projects, elements, or configuration.
///
/// Load errors short-circuit the entire session: nothing is scheduled when
/// the input does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadError {
    /// Sub-code identifying the failure class.
    pub reason: LoadErrorReason,
    /// Provenance string (`file [line L column C]`) when the failure can be
    /// attributed to a declaration.
    pub provenance: Option<String>,
    /// Short human-readable message.
    pub message: String,
    /// Optional multi-line detail block (e.g. a cycle path).
    pub detail: Option<String>,
}

impl LoadError {
    /// Create a load error without provenance.
    pub fn new(reason: LoadErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            provenance: None,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a provenance string (builder style).
    #[must_use]
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = Some(provenance.into());
        self
    }

    /// Attach a detail block (builder style).
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref p) = self.provenance {
            write!(f, "{p}: ")?;
        }
        write!(f, "[{}] {}", self.reason, self.message)
    }
}

impl std::error::Error for LoadError {}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// A per-element failure raised by a source or element plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("element {element}: {message}")]
pub struct ElementError {
    /// Name of the failing element.
    pub element: String,
    /// Short human-readable message.
    pub message: String,
    /// Optional detail block (e.g. captured build output).
    pub detail: Option<String>,
    /// Whether the scheduler may retry the failed job.
    pub retriable: bool,
}

impl ElementError {
    /// Create a permanent (non-retriable) element error.
    pub fn new(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            message: message.into(),
            detail: None,
            retriable: false,
        }
    }

    /// Mark the error as retriable (builder style).
    #[must_use]
    pub fn retriable(mut self) -> Self {
        self.retriable = true;
        self
    }

    /// Attach a detail block (builder style).
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Sandbox setup or command execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("sandbox: {message}")]
pub struct SandboxError {
    /// Short human-readable message.
    pub message: String,
    /// Optional detail block (e.g. the failing command line).
    pub detail: Option<String>,
}

impl SandboxError {
    /// Create a sandbox error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a detail block (builder style).
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Machine-readable sub-code attached to every [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheErrorReason {
    /// A configured remote could not be reached.
    RemoteUnreachable,
    /// A blob failed its digest check.
    CorruptBlob,
    /// An artifact's embedded key disagrees with the key it was fetched by.
    KeyMismatch,
}

impl CacheErrorReason {
    /// Stable string form of the sub-code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteUnreachable => "REMOTE_UNREACHABLE",
            Self::CorruptBlob => "CORRUPT_BLOB",
            Self::KeyMismatch => "KEY_MISMATCH",
        }
    }
}

impl fmt::Display for CacheErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact cache failure, local or remote.
///
/// Remote cache errors are usually degraded to warnings by the scheduler;
/// they only fail a session when the user requested a mandatory push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{reason}] {message}")]
pub struct CacheError {
    /// Sub-code identifying the failure class.
    pub reason: CacheErrorReason,
    /// Short human-readable message.
    pub message: String,
}

impl CacheError {
    /// Create a cache error.
    pub fn new(reason: CacheErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// The closed set of failures a strata session can surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Project, element, or configuration loading failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A plugin reported a per-element failure.
    #[error(transparent)]
    Element(#[from] ElementError),

    /// Sandbox setup or execution failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The artifact cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Internal scheduler invariant violation; never retriable.
    #[error("scheduler: {0}")]
    Scheduler(String),

    /// The user interrupted the session.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Whether the scheduler may re-queue the job that produced this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Element(e) => e.retriable,
            Self::Cache(c) => c.reason == CacheErrorReason::RemoteUnreachable,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Process exit code for a fully successful session.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for a recoverable failure (e.g. an element failed
/// under `--keep-going`).
pub const EXIT_RECOVERABLE: i32 = 1;
/// Process exit code for a fatal failure.
pub const EXIT_FATAL: i32 = 2;
/// Process exit code when the session was interrupted by a signal.
pub const EXIT_INTERRUPTED: i32 = 130;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_LOAD_REASONS: &[LoadErrorReason] = &[
        LoadErrorReason::MissingFile,
        LoadErrorReason::LoadingDirectory,
        LoadErrorReason::InvalidYaml,
        LoadErrorReason::InvalidData,
        LoadErrorReason::InvalidSymbolName,
        LoadErrorReason::UnresolvedVariable,
        LoadErrorReason::CircularReferenceVariable,
        LoadErrorReason::RecursiveVariable,
        LoadErrorReason::IllegalComposite,
        LoadErrorReason::TrailingListDirective,
        LoadErrorReason::CircularDependency,
    ];

    #[test]
    fn load_reason_strings_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for reason in ALL_LOAD_REASONS {
            assert!(seen.insert(reason.as_str()), "duplicate: {reason}");
        }
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn load_reason_serialises_to_as_str() {
        for reason in ALL_LOAD_REASONS {
            let json = serde_json::to_string(reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn load_error_display_with_provenance() {
        let err = LoadError::new(LoadErrorReason::InvalidData, "expected a mapping")
            .with_provenance("project.yaml [line 4 column 2]");
        assert_eq!(
            err.to_string(),
            "project.yaml [line 4 column 2]: [INVALID_DATA] expected a mapping"
        );
    }

    #[test]
    fn load_error_display_without_provenance() {
        let err = LoadError::new(LoadErrorReason::MissingFile, "no such file: a.yaml");
        assert_eq!(err.to_string(), "[MISSING_FILE] no such file: a.yaml");
    }

    #[test]
    fn element_error_retriable_flag() {
        let err = ElementError::new("base/alpine.bst", "fetch timed out").retriable();
        assert!(Error::from(err).is_retriable());

        let err = ElementError::new("base/alpine.bst", "configure failed");
        assert!(!Error::from(err).is_retriable());
    }

    #[test]
    fn remote_unreachable_is_retriable() {
        let err = CacheError::new(CacheErrorReason::RemoteUnreachable, "connection refused");
        assert!(Error::from(err).is_retriable());

        let err = CacheError::new(CacheErrorReason::CorruptBlob, "digest mismatch");
        assert!(!Error::from(err).is_retriable());
    }

    #[test]
    fn scheduler_and_interrupt_are_never_retriable() {
        assert!(!Error::Scheduler("queue desync".into()).is_retriable());
        assert!(!Error::Interrupted.is_retriable());
    }

    #[test]
    fn error_roundtrips_through_serde() {
        let err = Error::from(
            LoadError::new(LoadErrorReason::CircularDependency, "cycle detected")
                .with_detail("a.bst -> b.bst -> a.bst"),
        );
        let json = serde_json::to_string(&err).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
