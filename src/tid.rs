//! Transaction id generation
//!
//! A tid correlates all wire exchanges belonging to one logical request.
//! The sequence counter is owned by an explicit [`TidSource`] injected into
//! the connector rather than living in ambient module state, so tests and
//! multi-connector processes each control their own sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Process-scoped tid generator.
///
/// Produces tids of the form `gw;<epoch-secs>;<entropy>;<seqno>`. The
/// entropy field distinguishes connectors started in the same second; the
/// seqno makes tids unique within one source.
#[derive(Debug)]
pub struct TidSource {
    entropy: u32,
    seqno: AtomicU64,
}

impl TidSource {
    pub fn new() -> Self {
        Self {
            entropy: rand::thread_rng().gen(),
            seqno: AtomicU64::new(0),
        }
    }

    /// Fixed entropy, for deterministic fixtures.
    pub fn with_entropy(entropy: u32) -> Self {
        Self {
            entropy,
            seqno: AtomicU64::new(0),
        }
    }

    pub fn next_tid(&self) -> String {
        let seq = self.seqno.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("gw;{};{:08x};{}", now, self.entropy, seq)
    }
}

impl Default for TidSource {
    fn default() -> Self {
        Self::new()
    }
}
