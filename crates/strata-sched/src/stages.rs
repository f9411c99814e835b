// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pipeline stages: Track, Pull, Fetch, Build, Push.
//!
//! Stage order is fixed. Track (optional, always first) pins source refs;
//! Pull tries the configured remotes; Fetch downloads sources; Build runs
//! the element in a sandbox and commits the artifact under both keys; Push
//! publishes built artifacts. Skip logic per stage follows the status
//! probe contract.

use crate::broker::{ResourceSpec, TOKEN_CACHE, TOKEN_NETWORK, TOKEN_PROCESS};
use crate::control::WorkerControl;
use crate::queue::{JobPayload, Probe, Queue};
use crate::session::Session;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_error::{ElementError, Error};
use strata_graph::{ElementId, Scope};
use strata_plugin::{BuildContext, SandboxCommand};
use tracing::{debug, warn};

fn element_error(session: &Session, id: ElementId, message: impl Into<String>) -> Error {
    Error::from(ElementError::new(session.graph().get(id).name(), message))
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// Resolves a ref for each unpinned source.
#[derive(Debug, Default)]
pub struct TrackQueue;

#[async_trait]
impl Queue for TrackQueue {
    fn name(&self) -> &'static str {
        "track"
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec::shared(&[TOKEN_NETWORK])
    }

    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error> {
        if session.sources_pinned(element)? {
            Ok(Probe::Skip)
        } else {
            Ok(Probe::Ready)
        }
    }

    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        mut control: WorkerControl,
    ) -> Result<JobPayload, Error> {
        let name = session.graph().get(element).name().to_owned();
        let mut refs = Vec::new();
        for (index, source) in session.sources_for(element)?.into_iter().enumerate() {
            if source.is_pinned() {
                continue;
            }
            control.checkpoint().await?;
            match source
                .track()
                .await
                .map_err(|e| e.into_element_error(&name))?
            {
                Some(reference) => refs.push((index, reference)),
                None => {
                    return Err(element_error(
                        &session,
                        element,
                        format!("source #{index} is unpinned but has nothing to track"),
                    ));
                }
            }
        }
        Ok(JobPayload::Tracked { refs })
    }

    fn done(
        &self,
        session: &Session,
        element: ElementId,
        payload: &JobPayload,
    ) -> Result<(), Error> {
        if let JobPayload::Tracked { refs } = payload {
            session.record_tracked_refs(element, refs);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

/// Attempts to fetch the artifact from any configured remote.
#[derive(Debug, Default)]
pub struct PullQueue;

#[async_trait]
impl Queue for PullQueue {
    fn name(&self) -> &'static str {
        "pull"
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec::shared(&[TOKEN_NETWORK, TOKEN_CACHE])
    }

    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error> {
        let graph = session.graph();
        let name = graph.get(element).name();

        if !session.sources_pinned(element)? {
            return Err(element_error(
                &session,
                element,
                "sources are not pinned; run `source track` first",
            ));
        }

        if session.config().strict {
            // Pulls go by the strong key; wait for the dependencies' keys.
            if !session.try_finalize_strong_key(element)? {
                return Ok(Probe::Pending);
            }
            if let Some(strong) = graph.get(element).strong_key() {
                if !session.artifact_present(element) && session.cas().contains(name, strong) {
                    session.record_artifact_present(element);
                }
            }
        } else {
            // Recovers the embedded strong key on a local weak match.
            let _ = session.try_finalize_strong_key(element)?;
        }

        if session.artifact_present(element) {
            session.record_pull_decision(element, false);
            return Ok(Probe::Skip);
        }
        if session.remotes().is_empty() {
            session.record_pull_decision(element, false);
            return Ok(Probe::Skip);
        }
        Ok(Probe::Ready)
    }

    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        mut control: WorkerControl,
    ) -> Result<JobPayload, Error> {
        let name = session.graph().get(element).name().to_owned();
        let Some(key) = session.pull_key(element) else {
            return Err(Error::Scheduler(format!(
                "pull started for '{name}' before its key resolved"
            )));
        };

        for remote in session.remotes() {
            control.checkpoint().await?;
            match remote.pull(&name, &key).await {
                Ok(Some(pulled)) => {
                    session.cas().commit(
                        &name,
                        &pulled.meta.strong_key,
                        &pulled.meta.weak_key,
                        pulled.tree.path(),
                        None,
                    )?;
                    debug!(target: "strata.queue", element = %name, remote = %remote.url(), "pulled");
                    return Ok(JobPayload::Pulled { found: true });
                }
                Ok(None) => {}
                Err(err) => {
                    // Degraded to a warning; the next remote may serve it.
                    warn!(target: "strata.queue", element = %name, remote = %remote.url(), error = %err, "pull failed");
                }
            }
        }
        // A miss is a successful job; the next queue sees the element.
        Ok(JobPayload::Pulled { found: false })
    }

    fn done(
        &self,
        session: &Session,
        element: ElementId,
        payload: &JobPayload,
    ) -> Result<(), Error> {
        let JobPayload::Pulled { found } = payload else {
            return Ok(());
        };
        session.record_pull_decision(element, *found);
        if *found {
            let name = session.graph().get(element).name();
            if let Some(key) = session.pull_key(element) {
                if let Some(artifact) = session.cas().lookup(name, &key)? {
                    session.adopt_embedded_strong_key(element, artifact.embedded_strong_key());
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Downloads the sources of elements that must build.
#[derive(Debug, Default)]
pub struct FetchQueue;

#[async_trait]
impl Queue for FetchQueue {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec::shared(&[TOKEN_NETWORK])
    }

    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error> {
        if session.artifact_present(element) || session.sources_cached(element)? {
            Ok(Probe::Skip)
        } else {
            Ok(Probe::Ready)
        }
    }

    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        mut control: WorkerControl,
    ) -> Result<JobPayload, Error> {
        let name = session.graph().get(element).name().to_owned();
        for source in session.sources_for(element)? {
            control.checkpoint().await?;
            if source
                .is_cached()
                .map_err(|e| e.into_element_error(&name))?
            {
                continue;
            }
            source
                .fetch()
                .await
                .map_err(|e| e.into_element_error(&name))?;
        }
        Ok(JobPayload::Fetched)
    }

    fn done(&self, _session: &Session, _element: ElementId, _payload: &JobPayload) -> Result<(), Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Runs the element in a sandbox and commits the artifact.
#[derive(Debug, Default)]
pub struct BuildQueue;

#[async_trait]
impl Queue for BuildQueue {
    fn name(&self) -> &'static str {
        "build"
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec::shared(&[TOKEN_PROCESS])
    }

    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error> {
        if session.artifact_present(element) {
            return Ok(Probe::Skip);
        }
        // Never start before every build dependency (and its runtime
        // closure) has an artifact available locally.
        let staged = session.graph().dependencies(element, Scope::Build, true);
        if !staged.iter().all(|dep| session.artifact_available(*dep)) {
            return Ok(Probe::Pending);
        }
        if !session.try_finalize_strong_key(element)? {
            return Ok(Probe::Pending);
        }
        Ok(Probe::Ready)
    }

    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        mut control: WorkerControl,
    ) -> Result<JobPayload, Error> {
        let graph = session.graph();
        let el = graph.get(element);
        let name = el.name().to_owned();

        let (Some(strong), Some(weak)) = (el.strong_key().cloned(), el.weak_key().cloned())
        else {
            return Err(Error::Scheduler(format!(
                "build started for '{name}' before its keys resolved"
            )));
        };

        control.checkpoint().await?;
        let workdir = tempfile::tempdir_in(session.cas().root().join("tmp"))
            .map_err(|err| element_error(&session, element, format!("creating build dir: {err}")))?;
        let root = workdir.path();
        let build_root = root.join("build");
        let install_root = root.join("install");
        for dir in [&build_root, &install_root] {
            std::fs::create_dir_all(dir).map_err(|err| {
                element_error(&session, element, format!("creating build dir: {err}"))
            })?;
        }

        let sandbox = session.sandbox(root);
        let environment = environment_map(&session, element)?;
        let mut log = String::new();

        // Stage the build dependencies and collect their integration
        // commands.
        let mut integrations: Vec<(String, Vec<String>)> = Vec::new();
        for dep in graph.dependencies(element, Scope::Build, true) {
            let dep_el = graph.get(dep);
            let Some(dep_key) = dep_el.strong_key() else {
                return Err(Error::Scheduler(format!(
                    "dependency '{}' of '{name}' has no strong key at build time",
                    dep_el.name()
                )));
            };
            let Some(artifact) = session.cas().lookup(dep_el.name(), dep_key)? else {
                return Err(element_error(
                    &session,
                    element,
                    format!("dependency artifact '{}' is not cached locally", dep_el.name()),
                ));
            };
            session.cas().checkout(&artifact, root)?;
            log.push_str(&format!("staged {}\n", dep_el.name()));

            let dep_kind = session.plugins().element(dep_el.kind())?;
            let commands = dep_kind.integration_commands(dep_el.public())?;
            if !commands.is_empty() {
                integrations.push((dep_el.name().to_owned(), commands));
            }
        }

        control.checkpoint().await?;
        for (dep_name, commands) in integrations {
            for script in commands {
                let mut command = SandboxCommand::shell(&script, "");
                command.env = environment.clone();
                let result = sandbox.run(&command).await?;
                log.push_str(&result.output);
                if result.exit_status != 0 {
                    return Err(element_error(
                        &session,
                        element,
                        format!("integration command of '{dep_name}' failed: {script}"),
                    ));
                }
            }
        }

        for source in session.sources_for(element)? {
            source
                .stage(&build_root)
                .await
                .map_err(|e| e.into_element_error(&name))?;
        }

        control.checkpoint().await?;
        let kind = session.plugins().element(el.kind())?;
        let context = BuildContext {
            element_name: name.clone(),
            config: el.config().clone(),
            environment,
            build_root,
            install_root: install_root.clone(),
            max_jobs: session.config().max_jobs,
        };
        if let Err(err) = kind.assemble(sandbox.as_ref(), &context).await {
            log.push_str(&format!("FAILURE: {err}\n"));
            if let Some(detail) = &err.detail {
                log.push_str(detail);
            }
            let _ = session.cas().write_log(&name, &strong, &log);
            return Err(err.into_element_error(&name).into());
        }

        log.push_str("build succeeded\n");
        session
            .cas()
            .commit(&name, &strong, &weak, &install_root, Some(&log))?;
        debug!(target: "strata.queue", element = %name, key = %strong.brief(), "built");
        Ok(JobPayload::Built)
    }

    fn done(
        &self,
        session: &Session,
        element: ElementId,
        _payload: &JobPayload,
    ) -> Result<(), Error> {
        session.record_built(element);
        Ok(())
    }
}

fn environment_map(
    session: &Session,
    element: ElementId,
) -> Result<BTreeMap<String, String>, Error> {
    let el = session.graph().get(element);
    let mut out = BTreeMap::new();
    for (key, value) in el.environment().items() {
        out.insert(key.to_owned(), value.as_str()?.to_owned());
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Publishes built artifacts to the configured push remote.
#[derive(Debug, Default)]
pub struct PushQueue;

#[async_trait]
impl Queue for PushQueue {
    fn name(&self) -> &'static str {
        "push"
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec::shared(&[TOKEN_NETWORK])
    }

    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error> {
        if session.push_remote().is_none() {
            return Ok(Probe::Skip);
        }
        // Only artifacts built this session are pushed; pulled or
        // already-cached ones are not.
        if session.was_built(element) {
            Ok(Probe::Ready)
        } else {
            Ok(Probe::Skip)
        }
    }

    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        mut control: WorkerControl,
    ) -> Result<JobPayload, Error> {
        let el = session.graph().get(element);
        let name = el.name().to_owned();
        let Some(remote) = session.push_remote().cloned() else {
            return Ok(JobPayload::Pushed { pushed: false });
        };
        let Some(strong) = el.strong_key() else {
            return Err(Error::Scheduler(format!(
                "push started for '{name}' before its key resolved"
            )));
        };
        let Some(artifact) = session.cas().lookup(&name, strong)? else {
            return Err(element_error(
                &session,
                element,
                "built artifact disappeared before push",
            ));
        };

        control.checkpoint().await?;
        match remote.push(&artifact.meta, &artifact.tree_path).await {
            Ok(()) => Ok(JobPayload::Pushed { pushed: true }),
            Err(err) if session.config().mandatory_push => Err(err.into()),
            Err(err) => {
                warn!(target: "strata.queue", element = %name, remote = %remote.url(), error = %err, "push failed");
                Ok(JobPayload::Pushed { pushed: false })
            }
        }
    }

    fn done(&self, _session: &Session, _element: ElementId, _payload: &JobPayload) -> Result<(), Error> {
        Ok(())
    }
}
