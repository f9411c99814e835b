// SPDX-License-Identifier: MIT OR Apache-2.0
//! Loading a project and its element graph from disk.
//!
//! A project directory holds a `project.yaml` and an element directory of
//! `.bst` declarations. Loading resolves each target element and its
//! transitive dependencies, composes project defaults under element
//! declarations, resolves variables, and rejects dependency cycles with the
//! full path. Junction elements import sub-projects; elements reached
//! through a junction are named `junction.bst:element.bst`.

use crate::element::{Element, ElementId, SourceDecl};
use crate::graph::ElementGraph;
use std::path::{Path, PathBuf};
use strata_error::{LoadError, LoadErrorReason};
use strata_node::{FileRegistry, Node, load_string};
use strata_vars::{Builtins, Variables};
use tracing::debug;

const PROJECT_CONF: &str = "project.yaml";

const ELEMENT_KEYS: &[&str] = &[
    "kind",
    "description",
    "depends",
    "build-depends",
    "runtime-depends",
    "sources",
    "variables",
    "environment",
    "config",
    "public",
    "sandbox",
];

const PROJECT_KEYS: &[&str] = &["name", "element-path", "variables", "environment"];

/// A fully loaded project: the element graph plus project-level context.
#[derive(Debug)]
pub struct Project {
    /// The project name from `project.yaml`.
    pub name: String,
    /// The project root directory.
    pub directory: PathBuf,
    /// The loaded element graph.
    pub graph: ElementGraph,
    /// The composed project environment, shared by every element's keys.
    pub environment: Node,
}

impl Project {
    /// The project environment fragment that participates in cache keys.
    pub fn environment_for_keys(&self) -> serde_json::Value {
        strata_keys::canonicalize(&self.environment)
    }
}

/// Load a project and the dependency closure of `targets`.
pub fn load_project(
    registry: &FileRegistry,
    directory: &Path,
    targets: &[String],
    max_jobs: u32,
) -> Result<Project, LoadError> {
    let mut loader = Loader {
        registry,
        graph: ElementGraph::new(),
        max_jobs,
    };
    let context = loader.load_context(directory, "")?;

    let mut ids = Vec::with_capacity(targets.len());
    for target in targets {
        ids.push(loader.load_element(&context, target)?);
    }

    let graph = loader.graph;
    graph.detect_cycles()?;
    debug!(
        target: "strata.graph",
        elements = graph.len(),
        project = %context.project_name,
        "project loaded"
    );

    Ok(Project {
        name: context.project_name,
        directory: directory.to_owned(),
        graph,
        environment: context.environment,
    })
}

// Per-(sub)project loading context.
struct ProjectContext {
    project_name: String,
    // Empty for the root project, `junction.bst:` across a junction.
    prefix: String,
    directory: PathBuf,
    element_dir: PathBuf,
    variables: Node,
    environment: Node,
}

struct Loader<'a> {
    registry: &'a FileRegistry,
    graph: ElementGraph,
    max_jobs: u32,
}

impl Loader<'_> {
    fn load_context(&self, directory: &Path, prefix: &str) -> Result<ProjectContext, LoadError> {
        let conf_path = directory.join(PROJECT_CONF);
        let display = format!("{prefix}{PROJECT_CONF}");
        let conf = self.load_document(&conf_path, &display)?;
        conf.validate_keys(PROJECT_KEYS)?;

        let name = conf.get_str("name")?;
        let element_path = conf.get_str_or("element-path", "elements")?;

        let variables = match conf.get_mapping_opt("variables")? {
            Some(node) => node.clone(),
            None => Node::mapping(self.registry.synthetic()),
        };
        let environment = {
            let mut env = default_environment(self.registry);
            if let Some(node) = conf.get_mapping_opt("environment")? {
                node.composite(&mut env)?;
            }
            env.assert_fully_composited()?;
            env
        };

        Ok(ProjectContext {
            project_name: name,
            prefix: prefix.to_owned(),
            directory: directory.to_owned(),
            element_dir: directory.join(element_path),
            variables,
            environment,
        })
    }

    fn load_document(&self, path: &Path, display: &str) -> Result<Node, LoadError> {
        if path.is_dir() {
            return Err(LoadError::new(
                LoadErrorReason::LoadingDirectory,
                format!("expected a file, '{display}' is a directory"),
            ));
        }
        let contents = std::fs::read_to_string(path).map_err(|err| {
            let reason = if err.kind() == std::io::ErrorKind::NotFound {
                LoadErrorReason::MissingFile
            } else {
                LoadErrorReason::InvalidData
            };
            LoadError::new(reason, format!("could not read '{display}': {err}"))
        })?;
        load_string(self.registry, display, &contents)
    }

    fn load_element(&mut self, context: &ProjectContext, name: &str) -> Result<ElementId, LoadError> {
        validate_element_name(name)?;
        let full_name = format!("{}{}", context.prefix, name);

        // An element mid-load is already registered, so a dependency back
        // onto it terminates here; `detect_cycles` reports the loop after
        // loading completes.
        if let Some(id) = self.graph.lookup(&full_name) {
            return Ok(id);
        }
        self.load_element_inner(context, name, &full_name)
    }

    fn load_element_inner(
        &mut self,
        context: &ProjectContext,
        name: &str,
        full_name: &str,
    ) -> Result<ElementId, LoadError> {
        let path = context.element_dir.join(name);
        let node = self.load_document(&path, full_name)?;
        node.validate_keys(ELEMENT_KEYS)?;

        let kind = node.get_str("kind")?;
        let provenance = node.provenance().clone();

        // Dependencies, preserving declaration order per list.
        let mut build_deps: Vec<DependencyRef> = Vec::new();
        let mut runtime_deps: Vec<DependencyRef> = Vec::new();
        for dep in node.get_sequence_or_empty("depends")? {
            let parsed = parse_dependency(dep, None)?;
            match parsed.dep_type.as_str() {
                "build" => build_deps.push(parsed),
                "runtime" => runtime_deps.push(parsed),
                _ => {
                    build_deps.push(parsed.clone());
                    runtime_deps.push(parsed);
                }
            }
        }
        for dep in node.get_sequence_or_empty("build-depends")? {
            build_deps.push(parse_dependency(dep, Some("build"))?);
        }
        for dep in node.get_sequence_or_empty("runtime-depends")? {
            runtime_deps.push(parse_dependency(dep, Some("runtime"))?);
        }

        // Variables: built-in defaults, then project, then element.
        let mut vars_node = default_variables(self.registry);
        context.variables.composite(&mut vars_node)?;
        if let Some(element_vars) = node.get_mapping_opt("variables")? {
            element_vars.composite(&mut vars_node)?;
        }
        vars_node.assert_fully_composited()?;
        let variables = Variables::new(
            &vars_node,
            &Builtins {
                element_name: full_name.to_owned(),
                project_name: context.project_name.clone(),
                max_jobs: self.max_jobs,
            },
        )?;
        variables.check()?;

        // Environment: project defaults under the element's overrides.
        let mut environment = context.environment.clone();
        if let Some(element_env) = node.get_mapping_opt("environment")? {
            element_env.composite(&mut environment)?;
        }
        environment.assert_fully_composited()?;
        variables.expand(&mut environment)?;

        let mut config = match node.get_mapping_opt("config")? {
            Some(config) => config.clone(),
            None => Node::mapping(self.registry.synthetic()),
        };
        config.assert_fully_composited()?;
        variables.expand(&mut config)?;

        let mut public = match node.get_mapping_opt("public")? {
            Some(public) => public.clone(),
            None => Node::mapping(self.registry.synthetic()),
        };
        public.assert_fully_composited()?;
        variables.expand(&mut public)?;

        let mut sandbox = match node.get_mapping_opt("sandbox")? {
            Some(sandbox) => sandbox.clone(),
            None => Node::mapping(self.registry.synthetic()),
        };
        sandbox.assert_fully_composited()?;
        variables.expand(&mut sandbox)?;

        let mut sources = Vec::new();
        for source in node.get_sequence_or_empty("sources")? {
            source.as_mapping()?;
            let mut source_config = source.clone();
            variables.expand(&mut source_config)?;
            sources.push(SourceDecl {
                kind: source_config.get_str("kind")?,
                provenance: source_config.provenance().clone(),
                config: source_config,
            });
        }

        let element = Element::new(
            full_name.to_owned(),
            kind,
            provenance,
            config,
            sources,
            variables,
            environment,
            public,
            sandbox,
        );
        let id = self.graph.add(element);

        // Load the dependency targets and wire up the edges.
        for dep in &build_deps {
            let dep_id = self.load_dependency(context, dep)?;
            self.graph.add_build_dep(id, dep_id);
        }
        for dep in &runtime_deps {
            let dep_id = self.load_dependency(context, dep)?;
            self.graph.add_runtime_dep(id, dep_id);
        }

        Ok(id)
    }

    fn load_dependency(
        &mut self,
        context: &ProjectContext,
        dep: &DependencyRef,
    ) -> Result<ElementId, LoadError> {
        match &dep.junction {
            None => self.load_element(context, &dep.filename),
            Some(junction) => {
                let sub_context = self.load_junction(context, junction)?;
                self.load_element(&sub_context, &dep.filename)
            }
        }
    }

    // A junction element names a sub-project directory; elements across it
    // are prefixed with the junction's own name.
    fn load_junction(
        &mut self,
        context: &ProjectContext,
        junction: &str,
    ) -> Result<ProjectContext, LoadError> {
        validate_element_name(junction)?;
        let path = context.element_dir.join(junction);
        let display = format!("{}{}", context.prefix, junction);
        let node = self.load_document(&path, &display)?;

        let kind = node.get_str("kind")?;
        if kind != "junction" {
            return Err(LoadError::new(
                LoadErrorReason::InvalidData,
                format!("element '{display}' used as a junction but has kind '{kind}'"),
            )
            .with_provenance(node.provenance().to_string()));
        }
        let config = node.get_mapping("config")?;
        let sub_path = config.get_str("path")?;
        let sub_directory = context.directory.join(sub_path);
        let prefix = format!("{display}:");
        self.load_context(&sub_directory, &prefix)
    }
}

#[derive(Debug, Clone)]
struct DependencyRef {
    filename: String,
    dep_type: String,
    junction: Option<String>,
}

fn parse_dependency(node: &Node, forced_type: Option<&str>) -> Result<DependencyRef, LoadError> {
    match node.kind() {
        strata_node::NodeKind::Scalar => {
            let text = node.as_str()?;
            // `junction.bst:element.bst` is shorthand for the mapping form.
            let (junction, filename) = match text.split_once(':') {
                Some((junction, element)) => (Some(junction.to_owned()), element.to_owned()),
                None => (None, text.to_owned()),
            };
            Ok(DependencyRef {
                filename,
                dep_type: forced_type.unwrap_or("all").to_owned(),
                junction,
            })
        }
        strata_node::NodeKind::Mapping => {
            node.validate_keys(&["filename", "type", "junction"])?;
            let filename = node.get_str("filename")?;
            let dep_type = match forced_type {
                Some(forced) => {
                    if node.contains("type") {
                        return Err(LoadError::new(
                            LoadErrorReason::InvalidData,
                            "the 'type' key is not allowed in build-depends or runtime-depends",
                        )
                        .with_provenance(node.provenance().to_string()));
                    }
                    forced.to_owned()
                }
                None => node.get_enum("type", &["build", "runtime", "all"], Some("all"))?,
            };
            Ok(DependencyRef {
                filename,
                dep_type,
                junction: node.get_str_opt("junction")?,
            })
        }
        kind => Err(LoadError::new(
            LoadErrorReason::InvalidData,
            format!("a dependency must be a string or a mapping, found a {kind}"),
        )
        .with_provenance(node.provenance().to_string())),
    }
}

fn validate_element_name(name: &str) -> Result<(), LoadError> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(LoadError::new(
            LoadErrorReason::InvalidSymbolName,
            format!("invalid element name '{name}'"),
        ))
    }
}

fn default_variables(registry: &FileRegistry) -> Node {
    let mut node = Node::mapping(registry.synthetic());
    for (name, value) in [
        ("prefix", "/usr"),
        ("exec_prefix", "%{prefix}"),
        ("bindir", "%{exec_prefix}/bin"),
        ("libdir", "%{exec_prefix}/lib"),
        ("datadir", "%{prefix}/share"),
        ("sysconfdir", "/etc"),
    ] {
        let _ = node.insert(name, Node::scalar(value, registry.synthetic()));
    }
    node
}

fn default_environment(registry: &FileRegistry) -> Node {
    let mut node = Node::mapping(registry.synthetic());
    for (name, value) in [
        ("PATH", "/usr/bin:/bin:/usr/sbin:/sbin"),
        ("SHELL", "/bin/sh"),
        ("TERM", "dumb"),
        ("LC_ALL", "C.UTF-8"),
    ] {
        let _ = node.insert(name, Node::scalar(value, registry.synthetic()));
    }
    node
}

// ---------------------------------------------------------------------------
// Programmatic construction
// ---------------------------------------------------------------------------

/// Build an [`ElementGraph`] in memory, without files on disk.
///
/// Used by the scheduler's tests and by tooling that synthesises graphs.
#[derive(Debug)]
pub struct GraphBuilder {
    registry: FileRegistry,
    graph: ElementGraph,
    pending_build: Vec<(String, String)>,
    pending_runtime: Vec<(String, String)>,
}

impl GraphBuilder {
    /// Start building against the session's registry.
    #[must_use]
    pub fn new(registry: FileRegistry) -> Self {
        Self {
            registry,
            graph: ElementGraph::new(),
            pending_build: Vec::new(),
            pending_runtime: Vec::new(),
        }
    }

    /// Add an element with synthetic provenance and the given kind.
    pub fn element(&mut self, name: &str, kind: &str) -> Result<ElementId, LoadError> {
        let config = Node::mapping(self.registry.synthetic());
        self.element_with(name, kind, config, Vec::new())
    }

    /// Add an element with explicit configuration and sources.
    pub fn element_with(
        &mut self,
        name: &str,
        kind: &str,
        config: Node,
        sources: Vec<SourceDecl>,
    ) -> Result<ElementId, LoadError> {
        validate_element_name(name)?;
        let vars_node = default_variables(&self.registry);
        let variables = Variables::new(
            &vars_node,
            &Builtins {
                element_name: name.to_owned(),
                project_name: "synthetic".to_owned(),
                max_jobs: 1,
            },
        )?;
        let element = Element::new(
            name.to_owned(),
            kind.to_owned(),
            self.registry.synthetic(),
            config,
            sources,
            variables,
            Node::mapping(self.registry.synthetic()),
            Node::mapping(self.registry.synthetic()),
            Node::mapping(self.registry.synthetic()),
        );
        Ok(self.graph.add(element))
    }

    /// Declare a build dependency edge by element names.
    pub fn build_dep(&mut self, from: &str, to: &str) {
        self.pending_build.push((from.to_owned(), to.to_owned()));
    }

    /// Declare a runtime dependency edge by element names.
    pub fn runtime_dep(&mut self, from: &str, to: &str) {
        self.pending_runtime.push((from.to_owned(), to.to_owned()));
    }

    /// Wire the declared edges, reject cycles, and return the graph.
    pub fn finish(mut self) -> Result<ElementGraph, LoadError> {
        let resolve = |graph: &ElementGraph, name: &str| -> Result<ElementId, LoadError> {
            graph.lookup(name).ok_or_else(|| {
                LoadError::new(
                    LoadErrorReason::InvalidData,
                    format!("dependency on unknown element '{name}'"),
                )
            })
        };
        let mut edges: Vec<(ElementId, ElementId, bool)> = Vec::new();
        for (from, to) in &self.pending_build {
            let from = resolve(&self.graph, from)?;
            let to = resolve(&self.graph, to)?;
            edges.push((from, to, true));
        }
        for (from, to) in &self.pending_runtime {
            let from = resolve(&self.graph, from)?;
            let to = resolve(&self.graph, to)?;
            edges.push((from, to, false));
        }
        for (from, to, is_build) in edges {
            if is_build {
                self.graph.add_build_dep(from, to);
            } else {
                self.graph.add_runtime_dep(from, to);
            }
        }
        self.graph.detect_cycles()?;
        Ok(self.graph)
    }
}
