// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker control: cancellation and suspend/resume.
//!
//! Every worker receives a [`WorkerControl`] and polls it at coarse
//! checkpoints (sub-command boundaries, I/O chunks). Cancellation is
//! idempotent and observed by every clone; suspension parks workers at
//! their next checkpoint without releasing sandboxes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_error::Error;
use tokio::sync::{Notify, watch};

/// A cloneable token used to signal cancellation.
///
/// All clones share state; cancelling one makes every clone observe
/// `is_cancelled() == true` immediately.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes when the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// Scheduler-side switch that suspends and resumes all workers.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    /// Create a gate in the running (not paused) state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Park all workers at their next checkpoint.
    pub fn suspend(&self) {
        let _ = self.tx.send(true);
    }

    /// Let parked workers continue.
    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    /// Whether the gate is currently suspended.
    pub fn is_suspended(&self) -> bool {
        *self.tx.borrow()
    }

    fn watcher(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Worker-side handle
// ---------------------------------------------------------------------------

/// The control handle passed into every worker.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl WorkerControl {
    /// Create the worker view of a token and gate pair.
    #[must_use]
    pub fn new(cancel: CancellationToken, gate: &PauseGate) -> Self {
        Self {
            cancel,
            pause: gate.watcher(),
        }
    }

    /// A detached control that never cancels or pauses, for tests.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), &PauseGate::new())
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cooperative checkpoint.
    ///
    /// Returns [`Error::Interrupted`] when cancelled; otherwise waits out
    /// any suspension and returns `Ok`.
    pub async fn checkpoint(&mut self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        while *self.pause.borrow() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Interrupted),
                changed = self.pause.changed() => {
                    if changed.is_err() {
                        // Gate dropped; treat as resumed.
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}
