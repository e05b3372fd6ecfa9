//! Timeout policies
//!
//! A policy bundles every knob that shapes one logical call's resilience:
//! connect timeout, per-query timeout, the retry backoff schedule, how long
//! a failed address is considered down, and the pause before the single
//! dateline-invalid retry. Call sites select a policy by name ("fast",
//! "batch", "crawl") or pass a literal custom policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// One resolved timeout policy. All durations in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutPolicy {
    /// TCP connect timeout.
    pub connect: f64,
    /// Per-exchange send/receive timeout.
    pub timeout: f64,
    /// How long a failed address is filtered out of selection.
    pub down_interval: f64,
    /// Backoff before each attempt; the schedule length bounds the attempt
    /// count. First entry is zero by convention.
    pub retry: Vec<f64>,
    /// Pause before the single forced retry after a stale dateline.
    pub dateline_retry: f64,
}

impl TimeoutPolicy {
    /// Every duration knob must be a finite, non-negative number of seconds.
    ///
    /// Checked at registration and when resolving a custom literal, so a
    /// bad value can never reach `Duration::from_secs_f64` (which panics on
    /// negative or non-finite input) mid-request.
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            ("connect", self.connect),
            ("timeout", self.timeout),
            ("down_interval", self.down_interval),
            ("dateline_retry", self.dateline_retry),
        ];
        for (name, value) in scalars {
            if !value.is_finite() || value < 0.0 {
                return Err(GraphError::Config(format!(
                    "policy {} must be a finite non-negative duration, got {}",
                    name, value
                )));
            }
        }
        if self.retry.is_empty() {
            return Err(GraphError::Config(
                "policy retry schedule must have at least one entry".to_string(),
            ));
        }
        for (i, value) in self.retry.iter().enumerate() {
            if !value.is_finite() || *value < 0.0 {
                return Err(GraphError::Config(format!(
                    "policy retry[{}] must be a finite non-negative duration, got {}",
                    i, value
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn down_interval(&self) -> Duration {
        Duration::from_secs_f64(self.down_interval)
    }
}

/// Registration form of a policy: a literal map with every key required.
///
/// Deserializing through this type is what enforces "a policy missing a key
/// is a configuration error at registration time, not at use time".
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    pub connect: f64,
    pub timeout: f64,
    pub down_interval: f64,
    pub retry: Vec<f64>,
    pub dateline_retry: f64,
}

impl PolicySpec {
    /// Parse and validate a literal policy map from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<TimeoutPolicy> {
        let spec: PolicySpec = serde_json::from_value(json.clone())
            .map_err(|e| GraphError::Config(format!("invalid policy: {}", e)))?;
        spec.into_policy()
    }

    pub fn into_policy(self) -> Result<TimeoutPolicy> {
        let policy = TimeoutPolicy {
            connect: self.connect,
            timeout: self.timeout,
            down_interval: self.down_interval,
            retry: self.retry,
            dateline_retry: self.dateline_retry,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// How a call site names its policy.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyChoice {
    /// Look up a registered policy by name.
    Named(String),
    /// A one-off literal policy. Resolving one of these replaces the
    /// registry's current default (see [`PolicyRegistry::resolve`]).
    Custom(TimeoutPolicy),
}

/// Named policy table plus the connector's current default.
#[derive(Debug)]
pub struct PolicyRegistry {
    table: HashMap<String, TimeoutPolicy>,
    default: TimeoutPolicy,
}

fn builtin(connect: f64, timeout: f64, down: f64, retry: &[f64], dateline_retry: f64) -> TimeoutPolicy {
    TimeoutPolicy {
        connect,
        timeout,
        down_interval: down,
        retry: retry.to_vec(),
        dateline_retry,
    }
}

impl PolicyRegistry {
    /// Registry pre-loaded with the built-in named policies.
    pub fn with_builtins() -> Self {
        let default = builtin(8.0, 8.0, 30.0, &[0.0, 0.5, 1.0], 1.0);
        let mut table = HashMap::new();
        table.insert("default".to_string(), default.clone());
        table.insert("fast".to_string(), builtin(2.0, 2.0, 30.0, &[0.0], 0.5));
        table.insert("batch".to_string(), builtin(10.0, 60.0, 120.0, &[0.0, 1.0, 5.0], 2.0));
        table.insert(
            "crawl".to_string(),
            builtin(10.0, 300.0, 300.0, &[0.0, 2.0, 10.0, 30.0], 5.0),
        );
        Self { table, default }
    }

    /// Register a named policy; full key set enforced via [`PolicySpec`].
    pub fn register(&mut self, name: &str, spec: PolicySpec) -> Result<()> {
        let policy = spec.into_policy()?;
        self.table.insert(name.to_string(), policy);
        Ok(())
    }

    /// Resolve a call site's choice into a concrete policy.
    ///
    /// `None` yields the current default. A `Custom` literal resolves to
    /// itself AND becomes the new default for this registry's lifetime.
    /// That stickiness is inherited behavior and is surprising; confirmed
    /// operationally load-bearing before changing it.
    pub fn resolve(&mut self, choice: Option<&PolicyChoice>) -> Result<TimeoutPolicy> {
        match choice {
            None => Ok(self.default.clone()),
            Some(PolicyChoice::Named(name)) => self
                .table
                .get(name)
                .cloned()
                .ok_or_else(|| GraphError::Config(format!("unknown policy '{}'", name))),
            Some(PolicyChoice::Custom(policy)) => {
                // Literals skip PolicySpec, so the duration check happens
                // here instead.
                policy.validate()?;
                self.default = policy.clone();
                Ok(policy.clone())
            }
        }
    }

    pub fn current_default(&self) -> &TimeoutPolicy {
        &self.default
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_resolve_by_name() {
        let mut registry = PolicyRegistry::with_builtins();
        let fast = registry
            .resolve(Some(&PolicyChoice::Named("fast".to_string())))
            .unwrap();
        assert_eq!(fast.retry.len(), 1);
        assert_eq!(fast.timeout, 2.0);
    }

    #[test]
    fn unknown_name_is_config_error() {
        let mut registry = PolicyRegistry::with_builtins();
        let err = registry
            .resolve(Some(&PolicyChoice::Named("warp".to_string())))
            .unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));
    }

    #[test]
    fn missing_key_rejected_at_registration() {
        let json = json!({
            "connect": 1.0,
            "timeout": 1.0,
            "down_interval": 30.0
            // retry and dateline_retry missing
        });
        assert!(matches!(PolicySpec::from_json(&json), Err(GraphError::Config(_))));
    }

    #[test]
    fn unknown_key_rejected_at_registration() {
        let json = json!({
            "connect": 1.0,
            "timeout": 1.0,
            "down_interval": 30.0,
            "retry": [0.0],
            "dateline_retry": 1.0,
            "jitter": 0.1
        });
        assert!(matches!(PolicySpec::from_json(&json), Err(GraphError::Config(_))));
    }

    #[test]
    fn empty_retry_schedule_rejected() {
        let json = json!({
            "connect": 1.0,
            "timeout": 1.0,
            "down_interval": 30.0,
            "retry": [],
            "dateline_retry": 1.0
        });
        assert!(matches!(PolicySpec::from_json(&json), Err(GraphError::Config(_))));
    }

    #[test]
    fn negative_duration_rejected_at_registration() {
        // A negative value would panic in Duration::from_secs_f64 when the
        // policy is first used; it must never get that far.
        let json = json!({
            "connect": -1.0,
            "timeout": 1.0,
            "down_interval": 30.0,
            "retry": [0.0],
            "dateline_retry": 1.0
        });
        assert!(matches!(PolicySpec::from_json(&json), Err(GraphError::Config(_))));
    }

    #[test]
    fn non_finite_retry_entry_rejected_at_registration() {
        let spec = PolicySpec {
            connect: 1.0,
            timeout: 1.0,
            down_interval: 30.0,
            retry: vec![0.0, f64::NAN],
            dateline_retry: 1.0,
        };
        assert!(matches!(spec.into_policy(), Err(GraphError::Config(_))));
    }

    #[test]
    fn invalid_custom_literal_rejected_at_resolve() {
        let mut registry = PolicyRegistry::with_builtins();
        let bad = TimeoutPolicy {
            connect: 1.0,
            timeout: f64::INFINITY,
            down_interval: 30.0,
            retry: vec![0.0],
            dateline_retry: 1.0,
        };
        let err = registry
            .resolve(Some(&PolicyChoice::Custom(bad)))
            .unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));

        // The rejected literal did not become the default.
        assert_eq!(registry.current_default().connect, 8.0);
    }

    #[test]
    fn custom_policy_sticks_as_default() {
        let mut registry = PolicyRegistry::with_builtins();
        let custom = TimeoutPolicy {
            connect: 0.1,
            timeout: 0.2,
            down_interval: 5.0,
            retry: vec![0.0, 0.0],
            dateline_retry: 0.1,
        };
        let resolved = registry
            .resolve(Some(&PolicyChoice::Custom(custom.clone())))
            .unwrap();
        assert_eq!(resolved, custom);

        // Subsequent default resolution yields the custom policy.
        let default = registry.resolve(None).unwrap();
        assert_eq!(default, custom);
    }
}
