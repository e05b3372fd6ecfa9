//! Connector configuration
//!
//! Everything the connector consumes from the outside world at construction
//! time: the graphd address list, the default server-side work-unit cap, and
//! the debugging flag that disables socket timeouts entirely.

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::pool::Address;

/// Default server-side work-unit cap, in graphd time units.
///
/// Sent as `cost="tu=N"` on every request so a runaway query is cut off by
/// the server rather than by a client-side socket timeout.
pub const DEFAULT_QUERY_TIMEOUT_TU: u64 = 100_000;

/// Configuration for a [`TcpConnector`](crate::connector::TcpConnector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// graphd addresses, tried in pool order (random among live ones).
    pub addresses: Vec<Address>,

    /// Server-side work-unit cap attached to every request.
    #[serde(default = "default_tu")]
    pub default_query_timeout_tu: u64,

    /// Debugging only: when set, every computed timeout becomes "no timeout"
    /// rather than zero. Never enable in production.
    #[serde(default)]
    pub no_timeouts: bool,

    /// When set, write_varenv fails fast with a read-only error.
    #[serde(default)]
    pub read_only: bool,
}

fn default_tu() -> u64 {
    DEFAULT_QUERY_TIMEOUT_TU
}

impl ConnectorConfig {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            default_query_timeout_tu: DEFAULT_QUERY_TIMEOUT_TU,
            no_timeouts: false,
            read_only: false,
        }
    }

    /// Validate at construction: an empty address list is a configuration
    /// error, not something to discover at pick() time.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(GraphError::Config(
                "no graphd addresses supplied".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_addresses_rejected() {
        let config = ConnectorConfig::new(vec![]);
        assert!(matches!(config.validate(), Err(GraphError::Config(_))));
    }

    #[test]
    fn defaults_from_json() {
        let config: ConnectorConfig =
            serde_json::from_str(r#"{"addresses": [{"host": "g1", "port": 8100}]}"#).unwrap();
        assert_eq!(config.default_query_timeout_tu, DEFAULT_QUERY_TIMEOUT_TU);
        assert!(!config.no_timeouts);
        assert!(!config.read_only);
        config.validate().unwrap();
    }
}
