// SPDX-License-Identifier: MIT OR Apache-2.0
//! The resource broker.
//!
//! Finite token pools (`process`, `network`, `cache`, plus user-defined
//! ones) gate job admission. A job declares shared and exclusive claims;
//! admission is all-or-nothing, so the broker never partially reserves and
//! cannot deadlock. Leases release their tokens on drop — including panics
//! and cancellation — which keeps pool accounting exact on every exit
//! path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use strata_error::Error;

/// Pool name for parallel task slots.
pub const TOKEN_PROCESS: &str = "process";
/// Pool name for concurrent network operations.
pub const TOKEN_NETWORK: &str = "network";
/// Pool name for concurrent local-cache I/O.
pub const TOKEN_CACHE: &str = "cache";

/// The tokens a job needs before it may start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Tokens claimed shared: one slot each.
    pub shared: Vec<String>,
    /// Tokens claimed exclusive: the whole pool, with no concurrent user.
    pub exclusive: Vec<String>,
}

impl ResourceSpec {
    /// A spec claiming single shared slots of the given pools.
    pub fn shared(tokens: &[&str]) -> Self {
        Self {
            shared: tokens.iter().map(|t| (*t).to_owned()).collect(),
            exclusive: Vec::new(),
        }
    }

    /// Add an exclusive claim (builder style).
    #[must_use]
    pub fn with_exclusive(mut self, token: &str) -> Self {
        self.exclusive.push(token.to_owned());
        self
    }
}

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    in_use: usize,
    exclusive_held: bool,
}

#[derive(Debug)]
struct BrokerInner {
    pools: Mutex<BTreeMap<String, PoolState>>,
}

/// Admission-controlled token pools.
#[derive(Debug, Clone)]
pub struct ResourceBroker {
    inner: Arc<BrokerInner>,
}

impl ResourceBroker {
    /// Create a broker over the given `(pool, capacity)` table.
    pub fn new(pools: impl IntoIterator<Item = (String, usize)>) -> Self {
        let pools = pools
            .into_iter()
            .map(|(name, capacity)| {
                (
                    name,
                    PoolState {
                        capacity,
                        in_use: 0,
                        exclusive_held: false,
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(BrokerInner {
                pools: Mutex::new(pools),
            }),
        }
    }

    /// Attempt to acquire every token in `spec` atomically.
    ///
    /// Returns `Ok(None)` when any token is unavailable — nothing is
    /// reserved in that case. An unknown pool name is a
    /// [`Error::Scheduler`] invariant violation.
    pub fn try_acquire(&self, spec: &ResourceSpec) -> Result<Option<ResourceLease>, Error> {
        let mut pools = self.inner.pools.lock().expect("broker lock poisoned");

        for token in spec.shared.iter().chain(&spec.exclusive) {
            if !pools.contains_key(token) {
                return Err(Error::Scheduler(format!("unknown resource token '{token}'")));
            }
        }

        // Feasibility across the whole claim set before touching anything.
        for token in &spec.shared {
            let pool = &pools[token];
            if pool.exclusive_held || pool.in_use >= pool.capacity {
                return Ok(None);
            }
        }
        for token in &spec.exclusive {
            let pool = &pools[token];
            if pool.exclusive_held || pool.in_use > 0 {
                return Ok(None);
            }
        }

        for token in &spec.shared {
            if let Some(pool) = pools.get_mut(token) {
                pool.in_use += 1;
            }
        }
        for token in &spec.exclusive {
            if let Some(pool) = pools.get_mut(token) {
                pool.exclusive_held = true;
            }
        }

        Ok(Some(ResourceLease {
            inner: Arc::clone(&self.inner),
            spec: spec.clone(),
        }))
    }

    /// Current number of leased slots in a pool (exclusive counts as the
    /// full capacity).
    pub fn in_use(&self, token: &str) -> usize {
        let pools = self.inner.pools.lock().expect("broker lock poisoned");
        pools
            .get(token)
            .map(|p| {
                if p.exclusive_held {
                    p.capacity.max(1)
                } else {
                    p.in_use
                }
            })
            .unwrap_or(0)
    }

    /// Whether every pool is fully idle.
    pub fn is_idle(&self) -> bool {
        let pools = self.inner.pools.lock().expect("broker lock poisoned");
        pools.values().all(|p| p.in_use == 0 && !p.exclusive_held)
    }
}

/// A held claim; tokens return to their pools when this drops.
#[derive(Debug)]
pub struct ResourceLease {
    inner: Arc<BrokerInner>,
    spec: ResourceSpec,
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let mut pools = self.inner.pools.lock().expect("broker lock poisoned");
        for token in &self.spec.shared {
            if let Some(pool) = pools.get_mut(token) {
                pool.in_use = pool.in_use.saturating_sub(1);
            }
        }
        for token in &self.spec.exclusive {
            if let Some(pool) = pools.get_mut(token) {
                pool.exclusive_held = false;
            }
        }
    }
}
