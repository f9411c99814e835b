// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sandbox contract and the shipped runners.
//!
//! The canonical contract: commands run as uid 0 / gid 0 over a read-only
//! filesystem with plugin-declared writable subtrees, network blocked
//! during build. The [`LocalSandbox`] shipped here is a plain process
//! runner for development and tests; it executes as the invoking user and
//! documents that deviation. Production deployments substitute a
//! containerised implementation of [`Sandbox`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use strata_error::SandboxError;
use tracing::debug;

/// One command execution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    /// Argv; the first entry is the program.
    pub argv: Vec<String>,
    /// Working directory; relative paths resolve against the sandbox root.
    pub working_dir: PathBuf,
    /// Environment; the sandbox passes exactly this set.
    pub env: BTreeMap<String, String>,
    /// Whether network access is permitted (fetch yes, build no).
    pub network: bool,
    /// Numeric uid to run as.
    pub uid: u32,
    /// Numeric gid to run as.
    pub gid: u32,
}

impl SandboxCommand {
    /// A shell command with the default build identity (uid 0, gid 0, no
    /// network).
    pub fn shell(script: &str, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv: vec!["sh".into(), "-e".into(), "-c".into(), script.into()],
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            network: false,
            uid: 0,
            gid: 0,
        }
    }
}

/// Where a command's output went.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Process exit status; zero is success.
    pub exit_status: i32,
    /// Captured interleaved stdout/stderr, for the build log.
    pub output: String,
}

/// A sandbox executes commands over a prepared filesystem root.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// The sandbox filesystem root.
    fn root(&self) -> &Path;

    /// Execute a command to completion.
    ///
    /// A non-zero exit status is reported in the output, not as an `Err`;
    /// `Err` means the sandbox itself failed to execute the command.
    async fn run(&self, command: &SandboxCommand) -> Result<CommandOutput, SandboxError>;
}

// ---------------------------------------------------------------------------
// Local process runner
// ---------------------------------------------------------------------------

/// Plain subprocess sandbox used by development builds and tests.
///
/// Deviations from the canonical contract: commands run as the invoking
/// user (no uid/gid switch), the filesystem is not remounted read-only,
/// and network blocking is not enforced.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    /// Create a sandbox over an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, command: &SandboxCommand) -> Result<CommandOutput, SandboxError> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(SandboxError::new("empty command"));
        };
        let cwd = self.root.join(&command.working_dir);
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|err| SandboxError::new(format!("creating working dir: {err}")))?;

        debug!(target: "strata.sandbox", program = %program, cwd = %cwd.display(), "exec");
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SandboxError::new(format!("could not execute '{program}': {err}"))
            })?;

        let collected = child
            .wait_with_output()
            .await
            .map_err(|err| SandboxError::new(format!("waiting for '{program}': {err}")))?;

        let mut output = String::from_utf8_lossy(&collected.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&collected.stderr));
        Ok(CommandOutput {
            exit_status: collected.status.code().unwrap_or(-1),
            output,
        })
    }
}

// ---------------------------------------------------------------------------
// Recording no-op runner
// ---------------------------------------------------------------------------

/// A sandbox that records commands and reports success, for tests.
#[derive(Debug, Default)]
pub struct NullSandbox {
    root: PathBuf,
    commands: Mutex<Vec<SandboxCommand>>,
}

impl NullSandbox {
    /// Create a recording sandbox rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// The commands run so far, in order.
    pub fn commands(&self) -> Vec<SandboxCommand> {
        self.commands.lock().expect("command log poisoned").clone()
    }
}

#[async_trait]
impl Sandbox for NullSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn run(&self, command: &SandboxCommand) -> Result<CommandOutput, SandboxError> {
        self.commands
            .lock()
            .expect("command log poisoned")
            .push(command.clone());
        Ok(CommandOutput::default())
    }
}
