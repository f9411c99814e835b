// SPDX-License-Identifier: MIT OR Apache-2.0
//! The strata job scheduler.
//!
//! A single cooperative orchestrator drives a pipeline of queues (Track,
//! Pull, Fetch, Build, Push) over the element graph. Jobs run as parallel
//! workers gated by a resource broker; cache keys resolve lazily as
//! dependencies complete; failures aggregate into a session report.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod control;
mod queue;
mod scheduler;
mod session;
mod stages;

pub use broker::{
    ResourceBroker, ResourceLease, ResourceSpec, TOKEN_CACHE, TOKEN_NETWORK, TOKEN_PROCESS,
};
pub use control::{CancellationToken, PauseGate, WorkerControl};
pub use queue::{ElementRecord, JobPayload, Probe, Queue, QueueState, QueueStatus};
pub use scheduler::{Scheduler, build_pipeline};
pub use session::{FailedElement, Session, SessionConfig, SessionReport};
pub use stages::{BuildQueue, FetchQueue, PullQueue, PushQueue, TrackQueue};
