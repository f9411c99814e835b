// SPDX-License-Identifier: MIT OR Apache-2.0
//! The queue framework.
//!
//! Each pipeline stage is a [`Queue`]: an insertion-ordered input, an
//! output feeding the next stage, and a result table retained for the
//! whole session. The status probe decides per element whether to skip,
//! run a job, or wait for a dependency; the `done` routine interprets job
//! results.

use crate::broker::ResourceSpec;
use crate::control::WorkerControl;
use crate::session::Session;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use strata_error::Error;
use strata_graph::ElementId;

/// Status of an element within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a dependency; re-checked next tick.
    Pending,
    /// Eligible to start, subject to resource availability.
    Ready,
    /// A job is executing.
    Running,
    /// Nothing to do; moved straight to the output.
    Skip,
    /// The job (or skip) completed successfully.
    Done,
    /// The job failed terminally.
    Failed,
}

/// Result of a queue's status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Move straight to the output queue without running a job.
    Skip,
    /// Enqueue a job, subject to resource availability.
    Ready,
    /// Re-check next tick.
    Pending,
}

/// Payload delivered by a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobPayload {
    /// New refs resolved for unpinned sources: `(source index, ref)`.
    Tracked {
        /// The resolved refs.
        refs: Vec<(usize, String)>,
    },
    /// A pull attempt finished; a miss is still a successful job.
    Pulled {
        /// Whether any remote had the artifact.
        found: bool,
    },
    /// Sources downloaded.
    Fetched,
    /// The element was built and committed to the local cache.
    Built,
    /// A push attempt finished.
    Pushed {
        /// Whether the artifact was actually uploaded.
        pushed: bool,
    },
    /// The stage had nothing to do.
    Skipped,
}

/// Final record for one element in one queue, retained for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ElementRecord {
    /// Terminal status.
    pub status: QueueStatus,
    /// Payload for successful jobs.
    pub payload: Option<JobPayload>,
    /// Error for failed jobs.
    pub error: Option<Error>,
}

/// A pipeline stage.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Stage name used in logs and the session report.
    fn name(&self) -> &'static str;

    /// The resource tokens a job of this stage claims.
    fn resources(&self) -> ResourceSpec;

    /// Status probe for one element.
    fn check(&self, session: &Session, element: ElementId) -> Result<Probe, Error>;

    /// The job body, run in a worker.
    async fn process(
        &self,
        session: Arc<Session>,
        element: ElementId,
        control: WorkerControl,
    ) -> Result<JobPayload, Error>;

    /// Interpret a successful job result, updating session state.
    fn done(
        &self,
        session: &Session,
        element: ElementId,
        payload: &JobPayload,
    ) -> Result<(), Error>;
}

/// Mutable per-queue bookkeeping owned by the scheduler.
#[derive(Debug, Default)]
pub struct QueueState {
    /// Elements awaiting a probe or a free resource, insertion-ordered.
    pub input: VecDeque<ElementId>,
    /// Elements whose jobs are executing.
    pub running: HashSet<ElementId>,
    /// Elements that completed this stage, insertion-ordered.
    pub output: Vec<ElementId>,
    /// Result table retained for the whole session.
    pub results: HashMap<ElementId, ElementRecord>,
    /// Retry attempts per element.
    pub attempts: HashMap<ElementId, u32>,
}

impl QueueState {
    /// Record a terminal result for an element.
    pub fn record(
        &mut self,
        element: ElementId,
        status: QueueStatus,
        payload: Option<JobPayload>,
        error: Option<Error>,
    ) {
        self.results.insert(
            element,
            ElementRecord {
                status,
                payload,
                error,
            },
        );
    }

    /// Whether this queue has no work left.
    pub fn is_drained(&self) -> bool {
        self.input.is_empty() && self.running.is_empty()
    }
}
