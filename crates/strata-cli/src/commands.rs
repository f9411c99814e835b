// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations.

use crate::{ArtifactCommands, Cli, Commands, DepsArg, SourceCommands, WorkspaceCommands};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_cas::{DirectoryRemote, LocalCas, RemoteCache};
use strata_config::{UserConfig, Workspaces};
use strata_error::{EXIT_SUCCESS, ElementError, Error};
use strata_graph::{ElementGraph, ElementId, Scope, load_project};
use strata_node::FileRegistry;
use strata_plugin::builtin_registry;
use strata_sched::{
    PullQueue, Queue, Scheduler, Session, SessionConfig, SessionReport, TrackQueue, build_pipeline,
};
use tracing::warn;

/// Shared context assembled once per invocation.
pub struct App {
    pub registry: FileRegistry,
    pub user: UserConfig,
    pub project_dir: PathBuf,
}

/// Dispatch the parsed command line.
pub async fn run(cli: Cli) -> Result<i32, Error> {
    let registry = FileRegistry::new();
    let (mut user, warnings) = UserConfig::load(&registry, cli.config.as_deref())?;
    user.apply_env(std::env::vars())?;
    for warning in warnings {
        warn!(target: "strata.config", "{warning}");
    }
    let app = App {
        registry,
        user,
        project_dir: cli.project.clone(),
    };

    match cli.command {
        Commands::Build {
            targets,
            deps,
            remote,
            push,
            keep_going,
            no_strict,
            retry_failed,
        } => {
            build(
                &app,
                &targets,
                deps,
                remote,
                push,
                keep_going,
                no_strict,
                retry_failed,
            )
            .await
        }
        Commands::Source { command } => match command {
            SourceCommands::Track { targets } => source_track(&app, &targets).await,
            SourceCommands::Fetch { targets } => source_fetch(&app, &targets).await,
            SourceCommands::Checkout { element, directory } => {
                source_checkout(&app, &element, &directory).await
            }
        },
        Commands::Artifact { command } => match command {
            ArtifactCommands::Pull { targets, remote } => {
                artifact_pull(&app, &targets, remote).await
            }
            ArtifactCommands::Push { targets, remote } => {
                artifact_push(&app, &targets, remote).await
            }
            ArtifactCommands::Checkout { element, directory } => {
                artifact_checkout(&app, &element, &directory).await
            }
            ArtifactCommands::Log { element } => artifact_log(&app, &element).await,
        },
        Commands::Shell { element, build } => shell(&app, &element, build).await,
        Commands::Workspace { command } => match command {
            WorkspaceCommands::Open { element, directory } => {
                workspace_open(&app, &element, &directory).await
            }
            WorkspaceCommands::Close { element } => workspace_close(&app, &element),
            WorkspaceCommands::Reset { element } => workspace_reset(&app, &element).await,
        },
        Commands::Show {
            targets,
            deps,
            format,
        } => crate::show::show(&app, &targets, deps, format.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Session assembly
// ---------------------------------------------------------------------------

pub struct Loaded {
    pub graph: Arc<ElementGraph>,
    pub session: Arc<Session>,
    pub targets: Vec<ElementId>,
}

fn remote_for(url: &str) -> Arc<dyn RemoteCache> {
    let path = url.strip_prefix("file://").unwrap_or(url);
    Arc::new(DirectoryRemote::new(path))
}

pub fn load(
    app: &App,
    targets: &[String],
    config: SessionConfig,
    extra_remote: Option<&str>,
    with_push: bool,
) -> Result<Loaded, Error> {
    let project = load_project(&app.registry, &app.project_dir, targets, app.user.max_jobs)?;
    let project_directory = project.directory.clone();
    let project_environment = project.environment_for_keys();
    let graph = Arc::new(project.graph);
    let cas = Arc::new(LocalCas::open(&app.user.cache_dir)?);

    let workspaces = Workspaces::load(&app.user.workspaces_path())?;
    let workspace_map: BTreeMap<String, PathBuf> = workspaces
        .iter()
        .map(|(element, dir)| (element.to_owned(), dir.to_owned()))
        .collect();

    let mut session = Session::new(
        Arc::clone(&graph),
        builtin_registry(),
        cas,
        config,
        project_directory,
        project_environment,
    )?
    .with_workspaces(workspace_map);

    for url in extra_remote.iter().copied().chain(app.user.remotes.iter().map(String::as_str)) {
        session = session.with_remote(remote_for(url));
    }
    if with_push {
        let push_url = extra_remote
            .map(str::to_owned)
            .or_else(|| app.user.push_remote.clone());
        if let Some(url) = push_url {
            session = session.with_push_remote(remote_for(&url));
        }
    }

    let mut ids = Vec::with_capacity(targets.len());
    for target in targets {
        let id = graph.lookup(target).ok_or_else(|| {
            Error::Scheduler(format!("target '{target}' vanished after loading"))
        })?;
        ids.push(id);
    }
    Ok(Loaded {
        graph,
        session: Arc::new(session),
        targets: ids,
    })
}

pub(crate) fn session_config(
    app: &App,
    strict: bool,
    keep_going: bool,
    mandatory_push: bool,
) -> SessionConfig {
    SessionConfig {
        strict,
        pools: app.user.pools.clone(),
        max_retries: app.user.max_retries,
        keep_going,
        mandatory_push,
        max_jobs: app.user.max_jobs,
        ..SessionConfig::default()
    }
}

async fn run_scheduler(
    loaded: &Loaded,
    queues: Vec<Arc<dyn Queue>>,
    deps: DepsArg,
) -> Result<SessionReport, Error> {
    let mut scheduler = Scheduler::new(Arc::clone(&loaded.session), queues);

    // SIGINT cancels all running jobs and ends the session.
    let interrupt = scheduler.interrupt_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match deps {
        DepsArg::Plan | DepsArg::All => scheduler.run(&loaded.targets).await,
        DepsArg::None => scheduler.run_plan(&loaded.targets).await,
        DepsArg::Run => {
            let plan = loaded.graph.runtime_closure(&loaded.targets);
            scheduler.run_plan(&plan).await
        }
    }
}

fn print_report(report: &SessionReport) {
    for failure in &report.failed {
        eprintln!("FAILED {} ({}): {}", failure.element, failure.queue, failure.error);
        if let Some(log) = &failure.log {
            eprintln!("    log: {log}");
        }
    }
    if report.interrupted {
        eprintln!("interrupted");
    }
    println!(
        "{} processed, {} skipped, {} failed",
        report.processed,
        report.skipped,
        report.failed.len()
    );
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn build(
    app: &App,
    targets: &[String],
    deps: DepsArg,
    remote: Option<String>,
    push: bool,
    keep_going: bool,
    no_strict: bool,
    retry_failed: bool,
) -> Result<i32, Error> {
    let strict = app.user.strict && !no_strict;
    let mut config = session_config(app, strict, keep_going, push);
    if retry_failed {
        config.max_retries += 1;
    }
    let loaded = load(app, targets, config, remote.as_deref(), true)?;
    let report = run_scheduler(&loaded, build_pipeline(false), deps).await?;
    print_report(&report);
    Ok(report.exit_code(keep_going))
}

// ---------------------------------------------------------------------------
// source
// ---------------------------------------------------------------------------

async fn source_track(app: &App, targets: &[String]) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, targets, config, None, false)?;
    let queues: Vec<Arc<dyn Queue>> = vec![Arc::new(TrackQueue)];
    let report = run_scheduler(&loaded, queues, DepsArg::Plan).await?;

    for (id, element) in loaded.graph.iter() {
        for (index, reference) in loaded.session.tracked_refs(id) {
            println!("{}: source #{index} ref {reference}", element.name());
        }
    }
    print_report(&report);
    Ok(report.exit_code(false))
}

async fn source_fetch(app: &App, targets: &[String]) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, targets, config, None, false)?;
    let queues: Vec<Arc<dyn Queue>> = vec![Arc::new(strata_sched::FetchQueue)];
    let report = run_scheduler(&loaded, queues, DepsArg::Plan).await?;
    print_report(&report);
    Ok(report.exit_code(false))
}

async fn source_checkout(app: &App, element: &str, directory: &Path) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, &[element.to_owned()], config, None, false)?;
    let id = loaded.targets[0];
    std::fs::create_dir_all(directory)
        .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
    for source in loaded.session.sources_for(id)? {
        source
            .stage(directory)
            .await
            .map_err(|e| Error::from(e.into_element_error(element)))?;
    }
    println!("checked out sources of {element} to {}", directory.display());
    Ok(EXIT_SUCCESS)
}

// ---------------------------------------------------------------------------
// artifact
// ---------------------------------------------------------------------------

// Strong keys for direct cache operations, resolved without running the
// scheduler: dependencies first, pull decisions pre-marked so non-strict
// sessions can fall back to computed keys.
fn finalize_keys(loaded: &Loaded) -> Result<(), Error> {
    for id in loaded.graph.plan(&loaded.targets) {
        loaded.session.record_pull_decision(id, false);
        let _ = loaded.session.try_finalize_strong_key(id)?;
    }
    Ok(())
}

fn cached_artifact(
    loaded: &Loaded,
    element: &str,
) -> Result<strata_cas::Artifact, Error> {
    let id = loaded
        .graph
        .lookup(element)
        .ok_or_else(|| Error::Scheduler(format!("unknown element '{element}'")))?;
    let strong = loaded
        .graph
        .get(id)
        .strong_key()
        .cloned()
        .ok_or_else(|| {
            Error::from(ElementError::new(element, "cache key could not be resolved"))
        })?;
    loaded
        .session
        .cas()
        .lookup(element, &strong)?
        .ok_or_else(|| Error::from(ElementError::new(element, "artifact is not cached locally")))
}

async fn artifact_pull(
    app: &App,
    targets: &[String],
    remote: Option<String>,
) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, targets, config, remote.as_deref(), false)?;
    let queues: Vec<Arc<dyn Queue>> = vec![Arc::new(PullQueue)];
    let report = run_scheduler(&loaded, queues, DepsArg::Plan).await?;
    print_report(&report);
    Ok(report.exit_code(false))
}

async fn artifact_push(
    app: &App,
    targets: &[String],
    remote: Option<String>,
) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, true);
    let loaded = load(app, targets, config, remote.as_deref(), true)?;
    let Some(push_remote) = loaded.session.push_remote().cloned() else {
        return Err(Error::from(ElementError::new(
            targets.join(", "),
            "no push remote configured",
        )));
    };
    finalize_keys(&loaded)?;

    for target in targets {
        let artifact = cached_artifact(&loaded, target)?;
        push_remote.push(&artifact.meta, &artifact.tree_path).await?;
        println!("pushed {target} ({})", artifact.meta.strong_key.brief());
    }
    Ok(EXIT_SUCCESS)
}

async fn artifact_checkout(app: &App, element: &str, directory: &Path) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, &[element.to_owned()], config, None, false)?;
    finalize_keys(&loaded)?;

    let artifact = cached_artifact(&loaded, element)?;
    std::fs::create_dir_all(directory)
        .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
    loaded.session.cas().checkout(&artifact, directory)?;
    println!("checked out {element} to {}", directory.display());
    Ok(EXIT_SUCCESS)
}

async fn artifact_log(app: &App, element: &str) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, &[element.to_owned()], config, None, false)?;
    finalize_keys(&loaded)?;

    let artifact = cached_artifact(&loaded, element)?;
    match loaded
        .session
        .cas()
        .read_log(element, &artifact.meta.strong_key)
    {
        Some(log) => print!("{log}"),
        None => println!("no log for {element}"),
    }
    Ok(EXIT_SUCCESS)
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

async fn shell(app: &App, element: &str, build_env: bool) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, &[element.to_owned()], config, None, false)?;
    finalize_keys(&loaded)?;
    let id = loaded.targets[0];
    let graph = &loaded.graph;

    let staging = tempfile::TempDir::new()
        .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
    let scope = if build_env { Scope::Build } else { Scope::Run };
    for dep in graph.dependencies(id, scope, true) {
        let dep_name = graph.get(dep).name().to_owned();
        let artifact = cached_artifact(&loaded, &dep_name)?;
        loaded.session.cas().checkout(&artifact, staging.path())?;
    }
    if build_env {
        // The build shell also gets the element's own staged sources.
        let build_dir = staging.path().join("build");
        std::fs::create_dir_all(&build_dir)
            .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
        for source in loaded.session.sources_for(id)? {
            source
                .stage(&build_dir)
                .await
                .map_err(|e| Error::from(e.into_element_error(element)))?;
        }
    }

    let mut environment: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in graph.get(id).environment().items() {
        environment.insert(key.to_owned(), value.as_str()?.to_owned());
    }

    println!("staged {element}; type 'exit' to leave the shell");
    let status = tokio::process::Command::new("sh")
        .current_dir(staging.path())
        .env_clear()
        .envs(&environment)
        .status()
        .await
        .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
    Ok(status.code().unwrap_or(EXIT_SUCCESS))
}

// ---------------------------------------------------------------------------
// workspace
// ---------------------------------------------------------------------------

async fn workspace_open(app: &App, element: &str, directory: &Path) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, &[element.to_owned()], config, None, false)?;
    let id = loaded.targets[0];

    std::fs::create_dir_all(directory)
        .map_err(|err| Error::from(ElementError::new(element, err.to_string())))?;
    for source in loaded.session.sources_for(id)? {
        source
            .stage(directory)
            .await
            .map_err(|e| Error::from(e.into_element_error(element)))?;
    }

    let path = app.user.workspaces_path();
    let mut workspaces = Workspaces::load(&path)?;
    workspaces.open(element, directory.to_owned());
    workspaces.save(&path)?;
    println!("opened workspace for {element} at {}", directory.display());
    Ok(EXIT_SUCCESS)
}

fn workspace_close(app: &App, element: &str) -> Result<i32, Error> {
    let path = app.user.workspaces_path();
    let mut workspaces = Workspaces::load(&path)?;
    match workspaces.close(element) {
        Some(directory) => {
            workspaces.save(&path)?;
            println!(
                "closed workspace for {element}; files remain at {}",
                directory.display()
            );
            Ok(EXIT_SUCCESS)
        }
        None => Err(Error::from(ElementError::new(
            element,
            "no open workspace",
        ))),
    }
}

async fn workspace_reset(app: &App, element: &str) -> Result<i32, Error> {
    let path = app.user.workspaces_path();
    let workspaces = Workspaces::load(&path)?;
    let Some(directory) = workspaces.get(element).map(Path::to_owned) else {
        return Err(Error::from(ElementError::new(element, "no open workspace")));
    };

    // Re-stage pristine sources over the workspace. The workspace overlay
    // must not shadow the declared sources while resetting, so close it
    // for the duration of this session.
    let mut closed = workspaces.clone();
    closed.close(element);
    closed.save(&path)?;
    let result = workspace_open(app, element, &directory).await;
    if result.is_err() {
        workspaces.save(&path)?;
    }
    result
}
