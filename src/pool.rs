//! Address pool with failure-window selection
//!
//! Tracks the configured graphd addresses and when each last failed.
//! Selection filters out addresses that failed within the policy's
//! down-interval and picks uniformly at random among the survivors. Random
//! (not round-robin) selection spreads retries so a just-recovered node is
//! not hammered by every client at once.
//!
//! The failure map is last-write-wins and tolerant of races, so a pool (or
//! just its failure map) may be shared across sessions when shared failure
//! knowledge is wanted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GraphError, Result};
use crate::policy::TimeoutPolicy;

/// A graphd server address. Identity is value equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Shared last-failure timestamps. Entries are never evicted; they age out
/// by comparison against `now - down_interval` at pick time.
pub type FailureMap = Arc<Mutex<HashMap<Address, Instant>>>;

/// Candidate addresses plus recent-failure knowledge.
#[derive(Debug, Clone)]
pub struct AddressPool {
    addresses: Vec<Address>,
    failures: FailureMap,
}

impl AddressPool {
    /// An empty address list is a configuration error at construction.
    pub fn new(addresses: Vec<Address>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(GraphError::Config(
                "address pool requires at least one address".to_string(),
            ));
        }
        Ok(Self {
            addresses,
            failures: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Same pool contents, sharing an existing failure map. Sessions that
    /// want independent failure tracking simply don't share.
    pub fn with_shared_failures(addresses: Vec<Address>, failures: FailureMap) -> Result<Self> {
        let mut pool = Self::new(addresses)?;
        pool.failures = failures;
        Ok(pool)
    }

    pub fn failures(&self) -> FailureMap {
        Arc::clone(&self.failures)
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Pick a live address under the policy's down-interval.
    ///
    /// If every address failed recently the whole list is used anyway: when
    /// the server looks all-down the only useful move is to try one.
    pub fn pick(&self, policy: &TimeoutPolicy) -> Address {
        self.pick_filtered(policy, None)
    }

    /// Like [`pick`](Self::pick), but prefers an address other than `avoid`.
    /// Used after a snapshotting reply: the condition is per-node and
    /// another node can usually serve immediately.
    pub fn pick_other(&self, policy: &TimeoutPolicy, avoid: &Address) -> Address {
        self.pick_filtered(policy, Some(avoid))
    }

    fn pick_filtered(&self, policy: &TimeoutPolicy, avoid: Option<&Address>) -> Address {
        let now = Instant::now();
        let down = policy.down_interval();
        let failures = self.failures.lock().unwrap();

        let live: Vec<&Address> = self
            .addresses
            .iter()
            .filter(|addr| match failures.get(addr) {
                Some(when) => now.duration_since(*when) > down,
                None => true,
            })
            .collect();

        let mut candidates = if live.is_empty() {
            warn!(
                addresses = self.addresses.len(),
                "all graphd addresses marked down; falling back to full list"
            );
            self.addresses.iter().collect::<Vec<_>>()
        } else {
            live
        };

        if let Some(avoid) = avoid {
            if candidates.len() > 1 {
                candidates.retain(|addr| *addr != avoid);
            }
        }

        (*candidates
            .choose(&mut rand::thread_rng())
            .expect("candidate list is never empty"))
        .clone()
    }

    /// Record a failure timestamp for an address. Never proactively
    /// cleared; only the time-window check at pick() forgives it.
    pub fn record_failure(&self, addr: &Address) {
        self.failures
            .lock()
            .unwrap()
            .insert(addr.clone(), Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}
