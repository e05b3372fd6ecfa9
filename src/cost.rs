//! Cost accounting across retries and sub-requests
//!
//! Every graphd reply carries a cost string of space-separated `key=value`
//! pairs (`tu=5 mm=3 ...`). The connector folds these into a running total
//! so a caller can see what one logical request cost across all the wire
//! exchanges it took.
//!
//! Two aggregation rules exist and must not be confused:
//! - additive keys sum across exchanges (`tu`, `dr`, ...),
//! - high-water-mark keys take the max (`mm`, `fm`), because peak memory on
//!   one attempt does not add to peak memory on the next.

use std::collections::HashMap;

/// Keys aggregated by max rather than sum. `mm` is peak memory, `fm` is
/// peak footprint.
const HIGH_WATER_KEYS: [&str; 2] = ["mm", "fm"];

/// Synthetic client-side keys maintained by the connector itself:
/// `gqr` counts retried wire exchanges, `mql_dbreqs` successful ones.
pub const KEY_RETRIES: &str = "gqr";
pub const KEY_DBREQS: &str = "mql_dbreqs";

/// Running cost totals for one connector.
#[derive(Debug, Default, Clone)]
pub struct CostAccumulator {
    totals: HashMap<String, f64>,
}

impl CostAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one reply's cost string into the totals.
    ///
    /// Malformed pairs are skipped rather than failing the exchange; the
    /// reply itself is already in hand and cost is advisory.
    pub fn absorb(&mut self, cost: &str) {
        for pair in cost.split_ascii_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            self.record(key, value);
        }
    }

    /// Record one key, applying the additive / high-water distinction.
    pub fn record(&mut self, key: &str, value: f64) {
        let slot = self.totals.entry(key.to_string()).or_insert(0.0);
        if HIGH_WATER_KEYS.contains(&key) {
            if value > *slot {
                *slot = value;
            }
        } else {
            *slot += value;
        }
    }

    /// Add to a synthetic client-side counter.
    pub fn bump(&mut self, key: &str) {
        self.record(key, 1.0);
    }

    pub fn get(&self, key: &str) -> f64 {
        self.totals.get(key).copied().unwrap_or(0.0)
    }

    /// Point-in-time copy of the totals.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.totals.clone()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
    }
}
