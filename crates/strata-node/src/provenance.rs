// SPDX-License-Identifier: MIT OR Apache-2.0
//! Source provenance for document nodes.
//!
//! Every [`Node`](crate::Node) records where it came from: a file handle
//! issued by the session's [`FileRegistry`], a line, and a column. Nodes
//! synthesised in memory carry the sentinel file handle and a monotonically
//! decreasing column so they remain distinguishable from parsed nodes.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// Index of a registered file within a session's [`FileRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    /// Sentinel id carried by synthetic (in-memory) nodes.
    pub const SYNTHETIC: FileId = FileId(u32::MAX);
}

/// Where a node was declared.
///
/// Lines and columns are 1-based for parsed nodes. Synthetic provenance has
/// line 0 and a negative, strictly decreasing column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// File handle, [`FileId::SYNTHETIC`] for in-memory nodes.
    pub file: FileId,
    /// Short display name of the file (interned, cheap to clone).
    pub name: Arc<str>,
    /// 1-based line, 0 for synthetic nodes.
    pub line: u32,
    /// 1-based column, negative for synthetic nodes.
    pub column: i32,
}

impl Provenance {
    /// Whether this provenance belongs to a synthetic node.
    pub fn is_synthetic(&self) -> bool {
        self.file == FileId::SYNTHETIC
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [line {} column {}]", self.name, self.line, self.column)
    }
}

/// Session-local registry of loaded files.
///
/// The registry hands out [`FileId`]s and mints provenance for both parsed
/// and synthetic nodes. It is owned by the session object, never a process
/// global, so tests can reset state by dropping it. Handles are cheap to
/// clone and share one underlying table.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    files: Mutex<Vec<Arc<str>>>,
    // Next synthetic column, counted down from -1.
    synthetic: AtomicI32,
}

impl FileRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file under its display name and return its handle.
    ///
    /// Registering the same name twice returns the existing handle.
    pub fn register(&self, name: impl AsRef<str>) -> FileId {
        let name = name.as_ref();
        let mut files = self.inner.files.lock().expect("file registry lock poisoned");
        if let Some(idx) = files.iter().position(|f| f.as_ref() == name) {
            return FileId(idx as u32);
        }
        files.push(Arc::from(name));
        FileId((files.len() - 1) as u32)
    }

    /// Display name of a registered file.
    ///
    /// Returns `<synthesised>` for the sentinel id.
    pub fn name(&self, file: FileId) -> Arc<str> {
        if file == FileId::SYNTHETIC {
            return Arc::from("<synthesised>");
        }
        let files = self.inner.files.lock().expect("file registry lock poisoned");
        files
            .get(file.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("<unknown>"))
    }

    /// Mint provenance for a parsed node.
    pub fn provenance(&self, file: FileId, line: u32, column: u32) -> Provenance {
        Provenance {
            file,
            name: self.name(file),
            line,
            column: column as i32,
        }
    }

    /// Mint provenance for a synthetic node.
    ///
    /// Each call yields a distinct, strictly decreasing column.
    pub fn synthetic(&self) -> Provenance {
        let column = self.inner.synthetic.fetch_sub(1, Ordering::Relaxed) - 1;
        Provenance {
            file: FileId::SYNTHETIC,
            name: Arc::from("<synthesised>"),
            line: 0,
            column,
        }
    }

    /// Number of registered files.
    pub fn len(&self) -> usize {
        self.inner.files.lock().expect("file registry lock poisoned").len()
    }

    /// Whether no files have been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
