// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in plugins.
//!
//! Sources: `local` (a project-relative file tree, always pinned) and
//! `static` (inline content with an explicit ref, used by fixtures and
//! tests to exercise tracking). Element kinds: `import` (artifact is the
//! staged sources) and `manual` (explicit build/install command lists).

use crate::sandbox::{Sandbox, SandboxCommand};
use crate::{
    BuildContext, ElementKind, PluginError, PluginRegistry, Source, SourceContext, SourceFactory,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_error::LoadError;
use strata_keys::canonicalize;
use strata_node::Node;
use walkdir::WalkDir;

/// A registry pre-populated with every built-in plugin.
#[must_use]
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_source(Arc::new(LocalFactory));
    registry.register_source(Arc::new(StaticFactory));
    registry.register_element(Arc::new(ImportKind));
    registry.register_element(Arc::new(ManualKind));
    registry
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// Recursive copy preserving the relative layout. Symlinks are followed;
// extended attributes are not preserved.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// local source
// ---------------------------------------------------------------------------

struct LocalFactory;

impl SourceFactory for LocalFactory {
    fn kind(&self) -> &str {
        "local"
    }

    fn create(
        &self,
        config: &Node,
        context: &SourceContext,
    ) -> Result<Box<dyn Source>, LoadError> {
        config.validate_keys(&["kind", "path"])?;
        let path = config.get_str("path")?;
        Ok(Box::new(LocalSource {
            root: context.project_dir.join(path),
        }))
    }
}

struct LocalSource {
    root: PathBuf,
}

#[async_trait]
impl Source for LocalSource {
    // Content digest over the whole tree: relative paths and file bytes in
    // sorted order, so renames and edits both perturb the key.
    fn unique_key(&self) -> Result<String, PluginError> {
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|err| PluginError::permanent(err.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|err| PluginError::permanent(err.to_string()))?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            if entry.file_type().is_file() {
                let bytes = std::fs::read(entry.path())?;
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn is_pinned(&self) -> bool {
        // Local content has no ref; it is pinned by definition.
        true
    }

    fn is_cached(&self) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn track(&self) -> Result<Option<String>, PluginError> {
        Ok(None)
    }

    async fn fetch(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stage(&self, into: &Path) -> Result<(), PluginError> {
        if !self.root.exists() {
            return Err(PluginError::permanent(format!(
                "local source path '{}' does not exist",
                self.root.display()
            )));
        }
        copy_tree(&self.root, into)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// static source
// ---------------------------------------------------------------------------

struct StaticFactory;

impl SourceFactory for StaticFactory {
    fn kind(&self) -> &str {
        "static"
    }

    fn create(
        &self,
        config: &Node,
        _context: &SourceContext,
    ) -> Result<Box<dyn Source>, LoadError> {
        config.validate_keys(&["kind", "content", "filename", "ref"])?;
        Ok(Box::new(StaticSource {
            content: config.get_str("content")?,
            filename: config.get_str_or("filename", "content.txt")?,
            source_ref: config.get_str_opt("ref")?,
        }))
    }
}

struct StaticSource {
    content: String,
    filename: String,
    source_ref: Option<String>,
}

#[async_trait]
impl Source for StaticSource {
    fn unique_key(&self) -> Result<String, PluginError> {
        match &self.source_ref {
            Some(reference) => Ok(reference.clone()),
            None => Err(PluginError::permanent(
                "static source has no ref; run `source track` first",
            )),
        }
    }

    fn is_pinned(&self) -> bool {
        self.source_ref.is_some()
    }

    fn is_cached(&self) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn track(&self) -> Result<Option<String>, PluginError> {
        Ok(Some(hex_digest(self.content.as_bytes())))
    }

    async fn fetch(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stage(&self, into: &Path) -> Result<(), PluginError> {
        std::fs::create_dir_all(into)?;
        std::fs::write(into.join(&self.filename), self.content.as_bytes())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// import element
// ---------------------------------------------------------------------------

struct ImportKind;

#[async_trait]
impl ElementKind for ImportKind {
    fn kind(&self) -> &str {
        "import"
    }

    fn unique_key(&self, config: &Node) -> Result<String, PluginError> {
        Ok(strata_keys::digest(&kind_key_material(self.kind(), config))
            .as_hex()
            .to_owned())
    }

    fn configure(&self, config: &Node) -> Result<(), LoadError> {
        config.validate_keys(&[])
    }

    async fn assemble(
        &self,
        _sandbox: &dyn Sandbox,
        context: &BuildContext,
    ) -> Result<(), PluginError> {
        copy_tree(&context.build_root, &context.install_root)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// manual element
// ---------------------------------------------------------------------------

struct ManualKind;

#[async_trait]
impl ElementKind for ManualKind {
    fn kind(&self) -> &str {
        "manual"
    }

    fn unique_key(&self, config: &Node) -> Result<String, PluginError> {
        Ok(strata_keys::digest(&kind_key_material(self.kind(), config))
            .as_hex()
            .to_owned())
    }

    fn configure(&self, config: &Node) -> Result<(), LoadError> {
        config.validate_keys(&["build-commands", "install-commands"])?;
        config.get_str_list_or_empty("build-commands")?;
        config.get_str_list_or_empty("install-commands")?;
        Ok(())
    }

    async fn assemble(
        &self,
        sandbox: &dyn Sandbox,
        context: &BuildContext,
    ) -> Result<(), PluginError> {
        let mut commands = context
            .config
            .get_str_list_or_empty("build-commands")
            .map_err(|err| PluginError::permanent(err.to_string()))?;
        commands.extend(
            context
                .config
                .get_str_list_or_empty("install-commands")
                .map_err(|err| PluginError::permanent(err.to_string()))?,
        );

        for script in commands {
            let mut command = SandboxCommand::shell(&script, &context.build_root);
            command.env = context.environment.clone();
            command.env.insert(
                "INSTALL_ROOT".into(),
                context.install_root.display().to_string(),
            );
            command
                .env
                .insert("MAX_JOBS".into(), context.max_jobs.to_string());
            let result = sandbox
                .run(&command)
                .await
                .map_err(|err| PluginError::permanent(err.to_string()))?;
            if result.exit_status != 0 {
                return Err(PluginError::permanent(format!(
                    "command failed with exit status {}: {script}",
                    result.exit_status
                ))
                .with_detail(result.output));
            }
        }
        Ok(())
    }
}

fn kind_key_material(kind: &str, config: &Node) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("element-kind".into(), serde_json::Value::String(kind.to_owned()));
    map.insert("config".into(), canonicalize(config));
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_node::FileRegistry;

    fn context(dir: &Path) -> SourceContext {
        SourceContext {
            project_dir: dir.to_owned(),
            sources_dir: dir.join("sources"),
        }
    }

    #[tokio::test]
    async fn local_source_key_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("files");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("hello.txt"), "one").unwrap();

        let reg = FileRegistry::new();
        let mut config = Node::mapping(reg.synthetic());
        config.insert("kind", Node::scalar("local", reg.synthetic())).unwrap();
        config.insert("path", Node::scalar("files", reg.synthetic())).unwrap();

        let source = LocalFactory.create(&config, &context(dir.path())).unwrap();
        let before = source.unique_key().unwrap();

        std::fs::write(tree.join("hello.txt"), "two").unwrap();
        let after = source.unique_key().unwrap();
        assert_ne!(before, after);
        assert!(source.is_pinned());
    }

    #[tokio::test]
    async fn local_source_stages_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("files/nested");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("data"), "payload").unwrap();

        let reg = FileRegistry::new();
        let mut config = Node::mapping(reg.synthetic());
        config.insert("kind", Node::scalar("local", reg.synthetic())).unwrap();
        config.insert("path", Node::scalar("files", reg.synthetic())).unwrap();

        let source = LocalFactory.create(&config, &context(dir.path())).unwrap();
        let stage = dir.path().join("stage");
        source.stage(&stage).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(stage.join("nested/data")).unwrap(),
            "payload"
        );
    }

    #[tokio::test]
    async fn static_source_tracks_to_its_content_digest() {
        let reg = FileRegistry::new();
        let mut config = Node::mapping(reg.synthetic());
        config.insert("kind", Node::scalar("static", reg.synthetic())).unwrap();
        config.insert("content", Node::scalar("hello", reg.synthetic())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let source = StaticFactory.create(&config, &context(dir.path())).unwrap();
        assert!(!source.is_pinned());
        assert!(source.unique_key().is_err());

        let tracked = source.track().await.unwrap().unwrap();
        assert_eq!(tracked, hex_digest(b"hello"));
    }

    #[tokio::test]
    async fn manual_element_runs_commands_and_fails_on_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = crate::NullSandbox::new(dir.path());

        let reg = FileRegistry::new();
        let mut config = Node::mapping(reg.synthetic());
        config
            .insert(
                "build-commands",
                Node::sequence(
                    vec![Node::scalar("make", reg.synthetic())],
                    reg.synthetic(),
                ),
            )
            .unwrap();

        let context = BuildContext {
            element_name: "app.bst".into(),
            config,
            environment: Default::default(),
            build_root: dir.path().join("build"),
            install_root: dir.path().join("install"),
            max_jobs: 2,
        };
        ManualKind.assemble(&sandbox, &context).await.unwrap();

        let log = sandbox.commands();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].argv[3], "make");
        assert_eq!(log[0].env.get("MAX_JOBS").map(String::as_str), Some("2"));
        assert!(log[0].env.contains_key("INSTALL_ROOT"));
    }

    #[tokio::test]
    async fn import_element_copies_staged_sources() {
        let dir = tempfile::tempdir().unwrap();
        let build_root = dir.path().join("build");
        std::fs::create_dir_all(&build_root).unwrap();
        std::fs::write(build_root.join("artifact.txt"), "out").unwrap();

        let reg = FileRegistry::new();
        let context = BuildContext {
            element_name: "import.bst".into(),
            config: Node::mapping(reg.synthetic()),
            environment: Default::default(),
            build_root: build_root.clone(),
            install_root: dir.path().join("install"),
            max_jobs: 1,
        };
        let sandbox = crate::NullSandbox::new(dir.path());
        ImportKind.assemble(&sandbox, &context).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("install/artifact.txt")).unwrap(),
            "out"
        );
    }

    #[test]
    fn kind_unique_keys_differ_between_kinds() {
        let reg = FileRegistry::new();
        let config = Node::mapping(reg.synthetic());
        let import = ImportKind.unique_key(&config).unwrap();
        let manual = ManualKind.unique_key(&config).unwrap();
        assert_ne!(import, manual);
    }
}
