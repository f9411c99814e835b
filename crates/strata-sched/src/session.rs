// SPDX-License-Identifier: MIT OR Apache-2.0
//! The build session.
//!
//! A [`Session`] owns everything a scheduling run needs: the immutable
//! element graph, the plugin registry, the artifact cache, the configured
//! remotes, and the mutable per-element state (tracked refs, source keys,
//! pull decisions). Cache keys live here: weak keys resolve as soon as
//! sources are pinned; strong keys resolve per the plan mode — computed
//! from dependency keys in strict mode, recovered from weak-key-matched
//! artifacts in non-strict mode.

use crate::broker::{TOKEN_CACHE, TOKEN_NETWORK, TOKEN_PROCESS};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use strata_cas::{LocalCas, RemoteCache};
use strata_error::Error;
use strata_graph::{ElementGraph, ElementId, Scope};
use strata_keys::{CacheKey, DependencyContribution, ElementKeyInputs};
use strata_node::Node;
use strata_plugin::{PluginRegistry, Sandbox, Source, SourceContext};
use tracing::debug;

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Strict plan mode: strong keys are computed, never recovered.
    pub strict: bool,
    /// Resource pool capacities.
    pub pools: BTreeMap<String, usize>,
    /// Retry budget for retriable job failures.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_delay_ms: u64,
    /// Keep scheduling unaffected elements after a failure.
    pub keep_going: bool,
    /// Fail the session when a push fails.
    pub mandatory_push: bool,
    /// Grace window for cooperative cancellation, in milliseconds.
    pub grace_ms: u64,
    /// Parallel job count handed to element builds.
    pub max_jobs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(TOKEN_PROCESS.to_owned(), 4);
        pools.insert(TOKEN_NETWORK.to_owned(), 8);
        pools.insert(TOKEN_CACHE.to_owned(), 4);
        Self {
            strict: true,
            pools,
            max_retries: 2,
            retry_delay_ms: 500,
            keep_going: false,
            mandatory_push: false,
            grace_ms: 5_000,
            max_jobs: 4,
        }
    }
}

/// Mutable per-element scheduling state.
#[derive(Debug, Default)]
struct ElementState {
    tracked_refs: HashMap<usize, String>,
    source_keys: Option<Vec<String>>,
    // The strong key this session will use is fixed.
    key_final: bool,
    // The pull stage has decided (hit, miss, or skip).
    pull_decided: bool,
    artifact_present: bool,
    pulled: bool,
    built: bool,
}

type SandboxFactory = dyn Fn(&std::path::Path) -> Arc<dyn Sandbox> + Send + Sync;

/// Everything one scheduling run operates over.
pub struct Session {
    graph: Arc<ElementGraph>,
    plugins: PluginRegistry,
    cas: Arc<LocalCas>,
    remotes: Vec<Arc<dyn RemoteCache>>,
    push_remote: Option<Arc<dyn RemoteCache>>,
    config: SessionConfig,
    project_dir: PathBuf,
    project_env: serde_json::Value,
    sandbox_factory: Box<SandboxFactory>,
    workspaces: BTreeMap<String, PathBuf>,
    states: Mutex<HashMap<ElementId, ElementState>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("elements", &self.graph.len())
            .field("strict", &self.config.strict)
            .field("remotes", &self.remotes.len())
            .finish()
    }
}

impl Session {
    /// Create a session and validate every element's configuration against
    /// its kind plugin.
    pub fn new(
        graph: Arc<ElementGraph>,
        plugins: PluginRegistry,
        cas: Arc<LocalCas>,
        config: SessionConfig,
        project_dir: PathBuf,
        project_env: serde_json::Value,
    ) -> Result<Self, Error> {
        for (_, element) in graph.iter() {
            let kind = plugins.element(element.kind())?;
            kind.configure(element.config())?;
            for source in element.sources() {
                plugins.source(&source.kind)?;
            }
        }
        Ok(Self {
            graph,
            plugins,
            cas,
            remotes: Vec::new(),
            push_remote: None,
            config,
            project_dir,
            project_env,
            sandbox_factory: Box::new(|root| {
                Arc::new(strata_plugin::LocalSandbox::new(root)) as Arc<dyn Sandbox>
            }),
            workspaces: BTreeMap::new(),
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Overlay open workspaces: each maps an element name onto a local
    /// directory that replaces the element's declared sources.
    #[must_use]
    pub fn with_workspaces(mut self, workspaces: BTreeMap<String, PathBuf>) -> Self {
        self.workspaces = workspaces;
        self
    }

    /// Add a pull remote (builder style). Remotes are tried in order.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remotes.push(remote);
        self
    }

    /// Configure the push remote (builder style).
    #[must_use]
    pub fn with_push_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.push_remote = Some(remote);
        self
    }

    /// Replace the sandbox factory (tests use a recording sandbox).
    #[must_use]
    pub fn with_sandbox_factory(
        mut self,
        factory: impl Fn(&std::path::Path) -> Arc<dyn Sandbox> + Send + Sync + 'static,
    ) -> Self {
        self.sandbox_factory = Box::new(factory);
        self
    }

    // -- plain accessors ------------------------------------------------

    /// The element graph.
    pub fn graph(&self) -> &Arc<ElementGraph> {
        &self.graph
    }

    /// The plugin registry.
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// The local artifact cache.
    pub fn cas(&self) -> &Arc<LocalCas> {
        &self.cas
    }

    /// The configured pull remotes.
    pub fn remotes(&self) -> &[Arc<dyn RemoteCache>] {
        &self.remotes
    }

    /// The configured push remote, if any.
    pub fn push_remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        self.push_remote.as_ref()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a sandbox over `root`.
    pub fn sandbox(&self, root: &std::path::Path) -> Arc<dyn Sandbox> {
        (self.sandbox_factory)(root)
    }

    fn with_state<R>(&self, id: ElementId, f: impl FnOnce(&mut ElementState) -> R) -> R {
        let mut states = self.states.lock().expect("session state lock poisoned");
        f(states.entry(id).or_default())
    }

    // -- source handling ------------------------------------------------

    /// Instantiate the element's sources with any tracked refs applied.
    ///
    /// An open workspace replaces the declared sources wholesale with a
    /// `local` source over the workspace directory.
    pub fn sources_for(&self, id: ElementId) -> Result<Vec<Box<dyn Source>>, Error> {
        let element = self.graph.get(id);
        let context = SourceContext {
            project_dir: self.project_dir.clone(),
            sources_dir: self.cas.root().join("sources"),
        };
        if let Some(directory) = self.workspaces.get(element.name()) {
            let factory = self.plugins.source("local")?;
            let mut config = Node::mapping(element.provenance().clone());
            config.insert("kind", Node::scalar("local", element.provenance().clone()))?;
            config.insert(
                "path",
                Node::scalar(directory.display().to_string(), element.provenance().clone()),
            )?;
            return Ok(vec![factory.create(&config, &context)?]);
        }
        let tracked: HashMap<usize, String> =
            self.with_state(id, |s| s.tracked_refs.clone());

        let mut out = Vec::with_capacity(element.sources().len());
        for (index, decl) in element.sources().iter().enumerate() {
            let factory = self.plugins.source(&decl.kind)?;
            let mut config = decl.config.clone();
            if let Some(reference) = tracked.get(&index) {
                config.insert(
                    "ref",
                    Node::scalar(reference.clone(), config.provenance().clone()),
                )?;
            }
            out.push(factory.create(&config, &context)?);
        }
        Ok(out)
    }

    /// Refs resolved by the track stage so far: `(source index, ref)`.
    pub fn tracked_refs(&self, id: ElementId) -> Vec<(usize, String)> {
        self.with_state(id, |state| {
            let mut refs: Vec<(usize, String)> = state
                .tracked_refs
                .iter()
                .map(|(index, reference)| (*index, reference.clone()))
                .collect();
            refs.sort_by_key(|(index, _)| *index);
            refs
        })
    }

    /// Record refs resolved by the track stage.
    pub fn record_tracked_refs(&self, id: ElementId, refs: &[(usize, String)]) {
        self.with_state(id, |state| {
            for (index, reference) in refs {
                state.tracked_refs.insert(*index, reference.clone());
            }
            // Unique keys may now be computable.
            state.source_keys = None;
        });
    }

    /// Whether every source of the element is pinned.
    pub fn sources_pinned(&self, id: ElementId) -> Result<bool, Error> {
        Ok(self.sources_for(id)?.iter().all(|s| s.is_pinned()))
    }

    /// Whether every source reports its content locally present.
    pub fn sources_cached(&self, id: ElementId) -> Result<bool, Error> {
        let element = self.graph.get(id);
        for source in self.sources_for(id)? {
            if !source
                .is_cached()
                .map_err(|e| e.into_element_error(element.name()))?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn ensure_source_keys(&self, id: ElementId) -> Result<Option<Vec<String>>, Error> {
        if let Some(keys) = self.with_state(id, |s| s.source_keys.clone()) {
            return Ok(Some(keys));
        }
        let element = self.graph.get(id);
        let sources = self.sources_for(id)?;
        if !sources.iter().all(|s| s.is_pinned()) {
            return Ok(None);
        }
        let mut keys = Vec::with_capacity(sources.len());
        for source in &sources {
            keys.push(
                source
                    .unique_key()
                    .map_err(|e| e.into_element_error(element.name()))?,
            );
        }
        self.with_state(id, |s| s.source_keys = Some(keys.clone()));
        Ok(Some(keys))
    }

    // -- cache keys -----------------------------------------------------

    fn key_inputs(
        &self,
        id: ElementId,
        source_keys: Vec<String>,
    ) -> Result<ElementKeyInputs, Error> {
        let element = self.graph.get(id);
        let mut inputs = element.key_inputs(source_keys, self.project_env.clone())?;
        // The kind plugin owns its configuration digest.
        let kind = self.plugins.element(element.kind())?;
        let config_digest = kind
            .unique_key(element.config())
            .map_err(|e| e.into_element_error(element.name()))?;
        inputs.config = serde_json::Value::String(config_digest);
        Ok(inputs)
    }

    /// Resolve the weak key if the element's sources are pinned.
    pub fn ensure_weak_key(&self, id: ElementId) -> Result<Option<CacheKey>, Error> {
        let element = self.graph.get(id);
        if let Some(key) = element.weak_key() {
            return Ok(Some(key.clone()));
        }
        let Some(source_keys) = self.ensure_source_keys(id)? else {
            return Ok(None);
        };
        let inputs = self.key_inputs(id, source_keys)?;
        let dep_names: Vec<String> = element
            .build_deps()
            .iter()
            .map(|dep| self.graph.get(*dep).name().to_owned())
            .collect();
        let weak = inputs.weak_key(&dep_names);
        element.set_weak_key(weak.clone());
        debug!(target: "strata.keys", element = element.name(), weak = %weak.brief(), "weak key");
        Ok(Some(weak))
    }

    fn dep_contributions(
        &self,
        id: ElementId,
    ) -> Result<Option<Vec<DependencyContribution>>, Error> {
        let mut contributions: BTreeMap<String, CacheKey> = BTreeMap::new();
        for dep in self.graph.dependencies(id, Scope::Build, true) {
            if !self.with_state(dep, |s| s.key_final) {
                // Strict keys are static once refs are pinned, so they may
                // resolve recursively; non-strict keys must wait for the
                // dependency's own pull decision.
                if !self.config.strict || !self.try_finalize_strong_key(dep)? {
                    return Ok(None);
                }
            }
            let element = self.graph.get(dep);
            let Some(strong) = element.strong_key() else {
                return Ok(None);
            };
            contributions.insert(element.name().to_owned(), strong.clone());
        }
        Ok(Some(
            contributions
                .into_iter()
                .map(|(name, key)| DependencyContribution { name, key })
                .collect(),
        ))
    }

    /// Try to fix the strong key this session will use for the element.
    ///
    /// Strict mode computes it from the build dependencies' (final) strong
    /// keys. Non-strict mode first tries to recover the embedded strong key
    /// from a weak-key-matched local artifact; once the pull stage has
    /// decided there is none, it falls back to the computed key.
    pub fn try_finalize_strong_key(&self, id: ElementId) -> Result<bool, Error> {
        if self.with_state(id, |s| s.key_final) {
            return Ok(true);
        }
        let element = self.graph.get(id);
        let Some(weak) = self.ensure_weak_key(id)? else {
            return Ok(false);
        };

        if !self.config.strict {
            if let Some(artifact) = self.cas.lookup(element.name(), &weak)? {
                element.set_strong_key(artifact.embedded_strong_key().clone());
                self.with_state(id, |s| {
                    s.key_final = true;
                    s.artifact_present = true;
                });
                debug!(
                    target: "strata.keys",
                    element = element.name(),
                    strong = %artifact.embedded_strong_key().brief(),
                    "strong key recovered from artifact"
                );
                return Ok(true);
            }
            if !self.with_state(id, |s| s.pull_decided) {
                // A remote may still provide a weak match.
                return Ok(false);
            }
        }

        let Some(contributions) = self.dep_contributions(id)? else {
            return Ok(false);
        };
        let source_keys = match self.ensure_source_keys(id)? {
            Some(keys) => keys,
            None => return Ok(false),
        };
        let strong = self.key_inputs(id, source_keys)?.strong_key(&contributions);
        element.set_strong_key(strong.clone());
        self.with_state(id, |s| s.key_final = true);
        debug!(target: "strata.keys", element = element.name(), strong = %strong.brief(), "strong key computed");
        Ok(true)
    }

    /// The key artifacts are pulled by: strong in strict mode, weak in
    /// non-strict mode.
    pub fn pull_key(&self, id: ElementId) -> Option<CacheKey> {
        let element = self.graph.get(id);
        if self.config.strict {
            element.strong_key().cloned()
        } else {
            element.weak_key().cloned()
        }
    }

    // -- stage bookkeeping ----------------------------------------------

    /// Whether the element's artifact is available locally.
    pub fn artifact_present(&self, id: ElementId) -> bool {
        self.with_state(id, |s| s.artifact_present)
    }

    /// Like [`artifact_present`](Self::artifact_present), but also probes
    /// the local cache by strong key, recording a hit. Covers elements
    /// whose artifact was cached by an earlier session without this
    /// session's pull stage having seen them.
    pub fn artifact_available(&self, id: ElementId) -> bool {
        if self.with_state(id, |s| s.artifact_present) {
            return true;
        }
        let element = self.graph.get(id);
        if let Some(strong) = element.strong_key() {
            if self.cas.contains(element.name(), strong) {
                self.with_state(id, |s| s.artifact_present = true);
                return true;
            }
        }
        false
    }

    /// Whether the artifact was satisfied by a pull.
    pub fn was_pulled(&self, id: ElementId) -> bool {
        self.with_state(id, |s| s.pulled)
    }

    /// Whether the element was built this session.
    pub fn was_built(&self, id: ElementId) -> bool {
        self.with_state(id, |s| s.built)
    }

    /// Record the pull stage's decision for the element.
    pub fn record_pull_decision(&self, id: ElementId, found: bool) {
        self.with_state(id, |state| {
            state.pull_decided = true;
            if found {
                state.pulled = true;
                state.artifact_present = true;
            }
        });
    }

    /// Record a successful build.
    pub fn record_built(&self, id: ElementId) {
        self.with_state(id, |state| {
            state.built = true;
            state.artifact_present = true;
        });
    }

    /// Mark an artifact as locally present (used when a probe finds one).
    pub fn record_artifact_present(&self, id: ElementId) {
        self.with_state(id, |s| s.artifact_present = true);
    }

    /// Adopt the strong key embedded in a freshly pulled artifact
    /// (non-strict sessions).
    pub fn adopt_embedded_strong_key(&self, id: ElementId, strong: &CacheKey) {
        let element = self.graph.get(id);
        element.set_strong_key(strong.clone());
        self.with_state(id, |s| s.key_final = true);
    }
}

// ---------------------------------------------------------------------------
// Session report
// ---------------------------------------------------------------------------

/// One failed element in the final report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedElement {
    /// Element name.
    pub element: String,
    /// The queue the failure happened in.
    pub queue: String,
    /// The failure itself.
    pub error: Error,
    /// Build log path, when one was written.
    pub log: Option<String>,
}

/// The final session report.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionReport {
    /// Whether the session was interrupted by the user.
    pub interrupted: bool,
    /// Elements that failed, in failure order.
    pub failed: Vec<FailedElement>,
    /// Count of jobs that ran to completion.
    pub processed: usize,
    /// Count of stage entries skipped.
    pub skipped: usize,
    /// Terminal status per element and queue: `element → [(queue, status)]`.
    pub statuses: BTreeMap<String, Vec<(String, crate::queue::QueueStatus)>>,
}

impl SessionReport {
    /// The session exit code per the CLI contract.
    pub fn exit_code(&self, keep_going: bool) -> i32 {
        if self.interrupted {
            strata_error::EXIT_INTERRUPTED
        } else if self.failed.is_empty() {
            strata_error::EXIT_SUCCESS
        } else if keep_going {
            strata_error::EXIT_RECOVERABLE
        } else {
            strata_error::EXIT_FATAL
        }
    }
}
