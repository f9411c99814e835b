// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `strata` command-line front-end.

#![deny(unsafe_code)]

mod commands;
mod show;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use strata_error::{EXIT_FATAL, EXIT_INTERRUPTED};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Reproducible build orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// User configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

/// Dependency scope selector for `build` and `show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum DepsArg {
    /// The whole dependency closure.
    All,
    /// The build plan of the targets (default).
    #[default]
    Plan,
    /// The targets and their runtime closure.
    Run,
    /// Only the named targets.
    None,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build elements and their dependency plan.
    Build {
        /// Elements to build.
        #[arg(required = true)]
        targets: Vec<String>,

        /// Which dependencies to schedule.
        #[arg(long, value_enum, default_value_t)]
        deps: DepsArg,

        /// Additional pull remote, tried before the configured ones.
        #[arg(long)]
        remote: Option<String>,

        /// Push built artifacts; a push failure fails the build.
        #[arg(long)]
        push: bool,

        /// Continue scheduling unaffected elements after a failure.
        #[arg(long)]
        keep_going: bool,

        /// Disable strict plan mode for this session.
        #[arg(long)]
        no_strict: bool,

        /// Grant one extra retry to elements that failed retriably.
        #[arg(long)]
        retry_failed: bool,
    },

    /// Source operations.
    Source {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Artifact cache operations.
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },

    /// Stage an element's environment and open a shell in it.
    Shell {
        /// The element to shell into.
        element: String,

        /// Stage the build environment instead of the runtime one.
        #[arg(long)]
        build: bool,
    },

    /// Developer workspace overlays.
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Print the dependency graph and element states without running jobs.
    Show {
        /// Elements to show.
        #[arg(required = true)]
        targets: Vec<String>,

        /// Which dependencies to include.
        #[arg(long, value_enum, default_value_t)]
        deps: DepsArg,

        /// Line template; fields: %{name} %{key} %{full-key} %{state}.
        #[arg(long)]
        format: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SourceCommands {
    /// Resolve a ref for every unpinned source.
    Track {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Download sources for the build plan.
    Fetch {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Stage an element's sources into a directory.
    Checkout {
        element: String,
        directory: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ArtifactCommands {
    /// Pull artifacts from the configured remotes.
    Pull {
        #[arg(required = true)]
        targets: Vec<String>,
        /// Additional remote to try first.
        #[arg(long)]
        remote: Option<String>,
    },
    /// Push locally cached artifacts to the push remote.
    Push {
        #[arg(required = true)]
        targets: Vec<String>,
        /// Push remote override.
        #[arg(long)]
        remote: Option<String>,
    },
    /// Materialise an element's artifact into a directory.
    Checkout {
        element: String,
        directory: PathBuf,
    },
    /// Print an element's build log.
    Log { element: String },
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommands {
    /// Open a workspace: stage sources into a directory and record it.
    Open {
        element: String,
        directory: PathBuf,
    },
    /// Close an element's workspace.
    Close { element: String },
    /// Re-stage the element's sources into its open workspace.
    Reset { element: String },
}

fn init_tracing(debug: bool) {
    // The documented level vocabulary is debug/info/warning/error.
    let directive = match std::env::var(strata_config::ENV_LOG_LEVEL).ok().as_deref() {
        Some("warning") => "warn".to_owned(),
        Some(level) => level.to_owned(),
        None if debug => "strata=debug".to_owned(),
        None => "warn".to_owned(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let code = match commands::run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("strata: {error}");
            match error {
                strata_error::Error::Interrupted => EXIT_INTERRUPTED,
                _ => EXIT_FATAL,
            }
        }
    };
    std::process::exit(code);
}
