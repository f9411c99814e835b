// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scheduler loop.
//!
//! A single cooperative orchestrator drives the queues: skip-scan forward,
//! start ready jobs in reverse queue order (so work progresses as far down
//! the pipeline as possible before early stages soak up resources), then
//! block on the completion channel. Workers are tokio tasks holding a
//! resource lease for their whole lifetime; the lease drops on every exit
//! path, so pool accounting survives failures, cancellation, and aborts.

use crate::broker::ResourceBroker;
use crate::control::{CancellationToken, PauseGate, WorkerControl};
use crate::queue::{JobPayload, Probe, Queue, QueueState, QueueStatus};
use crate::session::{FailedElement, Session, SessionReport};
use crate::stages::{BuildQueue, FetchQueue, PullQueue, PushQueue, TrackQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_error::{ElementError, Error};
use strata_graph::{ElementId, Scope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Message {
    JobDone {
        queue: usize,
        element: ElementId,
        result: Result<JobPayload, Error>,
    },
    Requeue {
        queue: usize,
        element: ElementId,
    },
}

/// The standard build pipeline; `track` prepends the tracking stage.
pub fn build_pipeline(track: bool) -> Vec<Arc<dyn Queue>> {
    let mut queues: Vec<Arc<dyn Queue>> = Vec::new();
    if track {
        queues.push(Arc::new(TrackQueue));
    }
    queues.push(Arc::new(PullQueue));
    queues.push(Arc::new(FetchQueue));
    queues.push(Arc::new(BuildQueue));
    queues.push(Arc::new(PushQueue));
    queues
}

/// The multi-queue job scheduler.
pub struct Scheduler {
    session: Arc<Session>,
    queues: Vec<Arc<dyn Queue>>,
    states: Vec<QueueState>,
    broker: ResourceBroker,
    gate: Arc<PauseGate>,
    // External interrupt signal (SIGINT).
    interrupt: CancellationToken,
    // Propagated to every worker.
    job_cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    running: HashMap<(usize, ElementId), JoinHandle<()>>,
    pending_retries: usize,
    terminating: bool,
}

impl Scheduler {
    /// Create a scheduler over a session and an ordered queue list.
    pub fn new(session: Arc<Session>, queues: Vec<Arc<dyn Queue>>) -> Self {
        let broker = ResourceBroker::new(
            session
                .config()
                .pools
                .iter()
                .map(|(name, capacity)| (name.clone(), *capacity)),
        );
        let states = queues.iter().map(|_| QueueState::default()).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session,
            queues,
            states,
            broker,
            gate: Arc::new(PauseGate::new()),
            interrupt: CancellationToken::new(),
            job_cancel: CancellationToken::new(),
            tx,
            rx,
            running: HashMap::new(),
            pending_retries: 0,
            terminating: false,
        }
    }

    /// A token that interrupts the whole session when cancelled.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Park all workers at their next checkpoint.
    pub fn suspend(&self) {
        self.gate.suspend();
    }

    /// Resume parked workers.
    pub fn resume(&self) {
        self.gate.resume();
    }

    /// The broker, exposed for observation in tests and tooling.
    pub fn broker(&self) -> &ResourceBroker {
        &self.broker
    }

    /// Run the pipeline over the dependency plan of `targets` until every
    /// queue drains, a failure terminates the session, or the user
    /// interrupts it.
    pub async fn run(&mut self, targets: &[ElementId]) -> Result<SessionReport, Error> {
        let plan = self.session.graph().plan(targets);
        self.run_plan(&plan).await
    }

    /// Run the pipeline over an explicit element list, without expanding
    /// the dependency closure. Elements must be ordered dependencies-first
    /// when stages depend on it.
    pub async fn run_plan(&mut self, plan: &[ElementId]) -> Result<SessionReport, Error> {
        info!(target: "strata.sched", elements = plan.len(), queues = self.queues.len(), "session start");
        if let Some(first) = self.states.first_mut() {
            for element in plan {
                first.input.push_back(*element);
            }
        }

        let mut interrupted = false;
        loop {
            self.tick()?;
            if self.is_terminal() {
                break;
            }
            // With nothing in flight and no retry timers, no message can
            // ever arrive; the remaining elements wait on work that is not
            // scheduled (e.g. `--deps none` with uncached dependencies).
            if self.running.is_empty() && self.pending_retries == 0 {
                self.fail_stalled();
                continue;
            }
            tokio::select! {
                _ = self.interrupt.cancelled() => {
                    interrupted = true;
                    self.cancel_and_drain().await;
                    break;
                }
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message)?;
                    while let Ok(message) = self.rx.try_recv() {
                        self.handle(message)?;
                    }
                }
            }
        }

        let report = self.report(interrupted);
        info!(
            target: "strata.sched",
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed.len(),
            interrupted,
            "session end"
        );
        Ok(report)
    }

    // One cooperative pass: forward skip scan, then reverse-order starts.
    fn tick(&mut self) -> Result<(), Error> {
        for queue_index in 0..self.queues.len() {
            self.scan_skips(queue_index)?;
        }
        if !self.terminating && !self.interrupt.is_cancelled() {
            for queue_index in (0..self.queues.len()).rev() {
                self.start_ready(queue_index)?;
            }
        }
        Ok(())
    }

    fn scan_skips(&mut self, queue_index: usize) -> Result<(), Error> {
        let snapshot: Vec<ElementId> = self.states[queue_index].input.iter().copied().collect();
        for element in snapshot {
            match self.queues[queue_index].check(&self.session, element) {
                Ok(Probe::Skip) => {
                    self.remove_from_input(queue_index, element);
                    self.advance(queue_index, element, JobPayload::Skipped, QueueStatus::Skip);
                }
                Ok(_) => {}
                Err(error) => {
                    self.remove_from_input(queue_index, element);
                    self.fail_element(queue_index, element, error);
                }
            }
        }
        Ok(())
    }

    fn start_ready(&mut self, queue_index: usize) -> Result<(), Error> {
        let mut position = 0;
        while position < self.states[queue_index].input.len() {
            let element = self.states[queue_index].input[position];
            match self.queues[queue_index].check(&self.session, element) {
                Ok(Probe::Pending) => position += 1,
                Ok(Probe::Skip) => {
                    self.states[queue_index].input.remove(position);
                    self.advance(queue_index, element, JobPayload::Skipped, QueueStatus::Skip);
                }
                Ok(Probe::Ready) => {
                    let resources = self.queues[queue_index].resources();
                    match self.broker.try_acquire(&resources)? {
                        // Admission is FIFO within the queue; a blocked head
                        // must not be overtaken.
                        None => break,
                        Some(lease) => {
                            self.states[queue_index].input.remove(position);
                            self.spawn_job(queue_index, element, lease);
                        }
                    }
                }
                Err(error) => {
                    self.states[queue_index].input.remove(position);
                    self.fail_element(queue_index, element, error);
                }
            }
        }
        Ok(())
    }

    fn spawn_job(
        &mut self,
        queue_index: usize,
        element: ElementId,
        lease: crate::broker::ResourceLease,
    ) {
        self.states[queue_index].running.insert(element);
        let queue = Arc::clone(&self.queues[queue_index]);
        let session = Arc::clone(&self.session);
        let control = WorkerControl::new(self.job_cancel.clone(), &self.gate);
        let tx = self.tx.clone();
        debug!(
            target: "strata.sched",
            queue = queue.name(),
            element = self.session.graph().get(element).name(),
            "job start"
        );
        let handle = tokio::spawn(async move {
            // The lease lives exactly as long as the job.
            let _lease = lease;
            let result = queue.process(session, element, control).await;
            let _ = tx.send(Message::JobDone {
                queue: queue_index,
                element,
                result,
            });
        });
        self.running.insert((queue_index, element), handle);
    }

    fn handle(&mut self, message: Message) -> Result<(), Error> {
        match message {
            Message::Requeue { queue, element } => {
                self.pending_retries = self.pending_retries.saturating_sub(1);
                self.states[queue].input.push_back(element);
                Ok(())
            }
            Message::JobDone {
                queue,
                element,
                result,
            } => {
                self.states[queue].running.remove(&element);
                self.running.remove(&(queue, element));
                match result {
                    Ok(payload) => {
                        match self.queues[queue].done(&self.session, element, &payload) {
                            Ok(()) => {
                                self.advance(queue, element, payload, QueueStatus::Done);
                            }
                            Err(error) => self.fail_element(queue, element, error),
                        }
                    }
                    Err(Error::Interrupted) => {
                        // Cancelled mid-flight; the element stays incomplete.
                    }
                    Err(error) => self.maybe_retry(queue, element, error),
                }
                Ok(())
            }
        }
    }

    fn maybe_retry(&mut self, queue: usize, element: ElementId, error: Error) {
        let attempts = self.states[queue].attempts.entry(element).or_insert(0);
        let config = self.session.config();
        if error.is_retriable() && *attempts < config.max_retries && !self.interrupt.is_cancelled()
        {
            *attempts += 1;
            let delay = Duration::from_millis(
                config
                    .retry_delay_ms
                    .saturating_mul(1u64 << (*attempts - 1).min(16)),
            );
            warn!(
                target: "strata.sched",
                queue = self.queues[queue].name(),
                element = self.session.graph().get(element).name(),
                attempt = *attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );
            self.pending_retries += 1;
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Message::Requeue { queue, element });
            });
        } else {
            self.fail_element(queue, element, error);
        }
    }

    fn fail_element(&mut self, queue_index: usize, element: ElementId, error: Error) {
        let graph = Arc::clone(self.session.graph());
        let name = graph.get(element).name().to_owned();
        warn!(
            target: "strata.sched",
            queue = self.queues[queue_index].name(),
            element = %name,
            error = %error,
            "failed"
        );
        self.states[queue_index].record(element, QueueStatus::Failed, None, Some(error));

        let keep_going = self.session.config().keep_going;
        if !keep_going {
            // Reject new starts; let in-flight work finish.
            self.terminating = true;
        }

        // Reverse dependencies can no longer proceed.
        for state_index in 0..self.states.len() {
            let snapshot: Vec<ElementId> =
                self.states[state_index].input.iter().copied().collect();
            for candidate in snapshot {
                let depends = graph
                    .dependencies(candidate, Scope::All, true)
                    .contains(&element);
                if !depends || candidate == element {
                    continue;
                }
                self.remove_from_input(state_index, candidate);
                if keep_going {
                    // Dropped silently.
                    continue;
                }
                let derived = ElementError::new(
                    graph.get(candidate).name(),
                    format!("dependency '{name}' failed"),
                );
                self.states[state_index].record(
                    candidate,
                    QueueStatus::Failed,
                    None,
                    Some(derived.into()),
                );
            }
        }
    }

    fn advance(
        &mut self,
        queue_index: usize,
        element: ElementId,
        payload: JobPayload,
        status: QueueStatus,
    ) {
        self.states[queue_index].record(element, status, Some(payload), None);
        self.states[queue_index].output.push(element);
        if let Some(next) = self.states.get_mut(queue_index + 1) {
            next.input.push_back(element);
        }
    }

    // Fail every queued element: none of them can make progress.
    fn fail_stalled(&mut self) {
        for queue_index in 0..self.states.len() {
            while let Some(element) = self.states[queue_index].input.pop_front() {
                let name = self.session.graph().get(element).name().to_owned();
                self.states[queue_index].record(
                    element,
                    QueueStatus::Failed,
                    None,
                    Some(Error::Scheduler(format!(
                        "'{name}' waits on work that is not scheduled in this session"
                    ))),
                );
            }
        }
        self.terminating = true;
    }

    fn remove_from_input(&mut self, queue_index: usize, element: ElementId) {
        let input = &mut self.states[queue_index].input;
        if let Some(position) = input.iter().position(|e| *e == element) {
            input.remove(position);
        }
    }

    fn is_terminal(&self) -> bool {
        if self.pending_retries > 0 {
            return false;
        }
        if self.terminating {
            return self.running.is_empty();
        }
        self.states.iter().all(QueueState::is_drained)
    }

    // Cancel all workers, wait out the grace window, then abort stragglers.
    async fn cancel_and_drain(&mut self) {
        self.job_cancel.cancel();
        let grace = Duration::from_millis(self.session.config().grace_ms);
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        while !self.running.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    let _ = self.handle(message);
                }
            }
        }
        for ((queue_index, element), handle) in self.running.drain() {
            warn!(
                target: "strata.sched",
                queue = self.queues[queue_index].name(),
                element = self.session.graph().get(element).name(),
                "force-terminating worker"
            );
            handle.abort();
            self.states[queue_index].running.remove(&element);
        }
    }

    fn report(&self, interrupted: bool) -> SessionReport {
        let graph = self.session.graph();
        let mut report = SessionReport {
            interrupted,
            ..SessionReport::default()
        };
        for (queue_index, state) in self.states.iter().enumerate() {
            let queue_name = self.queues[queue_index].name().to_owned();
            for (element, record) in &state.results {
                let element_name = graph.get(*element).name().to_owned();
                report
                    .statuses
                    .entry(element_name.clone())
                    .or_default()
                    .push((queue_name.clone(), record.status));
                match record.status {
                    QueueStatus::Skip => report.skipped += 1,
                    QueueStatus::Done => report.processed += 1,
                    QueueStatus::Failed => {
                        let log = graph
                            .get(*element)
                            .strong_key()
                            .map(|key| self.session.cas().log_path(&element_name, key))
                            .filter(|path| path.is_file())
                            .map(|path| path.display().to_string());
                        report.failed.push(FailedElement {
                            element: element_name.clone(),
                            queue: queue_name.clone(),
                            error: record
                                .error
                                .clone()
                                .unwrap_or_else(|| Error::Scheduler("unrecorded failure".into())),
                            log,
                        });
                    }
                    _ => {}
                }
            }
        }
        report
    }
}
