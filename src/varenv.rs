//! Per-request variable environment
//!
//! A [`Varenv`] carries everything that scopes one logical request: the
//! transaction id, the session's write dateline, the timeout policy choice,
//! language/permission defaults, and the deferred-lookup manager. One is
//! constructed per top-level request; sub-queries run under a restricted
//! `child()`.
//!
//! The dateline contract lives here:
//! - `write_dateline` is session-scoped and fed back into every subsequent
//!   read so the session never observes data older than its own most recent
//!   write. Only successful writes advance it.
//! - `dateline` is the ephemeral read-scoped output of the last exchange,
//!   reported to the caller and never fed back automatically.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use crate::lookup::LookupManager;
use crate::policy::PolicyChoice;

/// Default language for value selection when a query doesn't say.
pub const DEFAULT_LANG: &str = "/lang/en";

#[derive(Debug)]
pub struct Varenv {
    /// Transaction id; generated by the connector on first use if unset.
    pub tid: Option<String>,

    /// Session consistency floor. Advanced only by successful writes.
    pub write_dateline: String,

    /// Wall-clock time of the session's last successful write.
    pub last_write_time: Option<SystemTime>,

    /// Ephemeral dateline from the most recent read. Output only.
    pub dateline: String,

    /// Timeout policy selection for this request.
    pub policy: Option<PolicyChoice>,

    pub lang: String,
    pub permission: Option<String>,
    pub user: Option<String>,

    /// Caller-supplied historical snapshot token (guid or timestamp),
    /// applied to reads only.
    pub asof: Option<String>,

    /// Absolute wall-time bound across all retries of this request.
    pub deadline: Option<Instant>,

    /// Set after the first successful write; subsequent writes in the same
    /// session are marked as protocol continuations (a server-side
    /// optimization hint, not a correctness requirement).
    pub is_write_continuation: bool,

    /// Variable names referenced while serving this request. Shared with
    /// the parent environment so mutations propagate upward even though no
    /// other key does. The asymmetry is deliberate: a parent query needs
    /// the union of variables its sub-queries touched.
    vars_used: Arc<Mutex<HashSet<String>>>,

    /// Deferred identifier translations batched for this request.
    pub lookups: LookupManager,
}

impl Varenv {
    pub fn new() -> Self {
        Self {
            tid: None,
            write_dateline: String::new(),
            last_write_time: None,
            dateline: String::new(),
            policy: None,
            lang: DEFAULT_LANG.to_string(),
            permission: None,
            user: None,
            asof: None,
            deadline: None,
            is_write_continuation: false,
            vars_used: Arc::new(Mutex::new(HashSet::new())),
            lookups: LookupManager::new(),
        }
    }

    /// Restricted environment for a sub-query.
    ///
    /// Propagates only tid, policy, lang, permission and user; shares
    /// `vars_used` with the parent. Everything else (write_dateline, asof,
    /// deadline, lookups) starts fresh.
    pub fn child(&self) -> Self {
        Self {
            tid: self.tid.clone(),
            write_dateline: String::new(),
            last_write_time: None,
            dateline: String::new(),
            policy: self.policy.clone(),
            lang: self.lang.clone(),
            permission: self.permission.clone(),
            user: self.user.clone(),
            asof: None,
            deadline: None,
            is_write_continuation: false,
            vars_used: Arc::clone(&self.vars_used),
            lookups: LookupManager::new(),
        }
    }

    /// Full independent copy. `vars_used` is snapshotted into a fresh set,
    /// so the copy no longer reports upward.
    pub fn copy(&self) -> Self {
        let snapshot = self.vars_used.lock().unwrap().clone();
        Self {
            tid: self.tid.clone(),
            write_dateline: self.write_dateline.clone(),
            last_write_time: self.last_write_time,
            dateline: self.dateline.clone(),
            policy: self.policy.clone(),
            lang: self.lang.clone(),
            permission: self.permission.clone(),
            user: self.user.clone(),
            asof: self.asof.clone(),
            deadline: self.deadline,
            is_write_continuation: self.is_write_continuation,
            vars_used: Arc::new(Mutex::new(snapshot)),
            lookups: self.lookups.clone(),
        }
    }

    /// Record that a named variable was referenced.
    pub fn use_var(&self, name: &str) {
        self.vars_used.lock().unwrap().insert(name.to_string());
    }

    pub fn vars_used(&self) -> HashSet<String> {
        self.vars_used.lock().unwrap().clone()
    }
}

impl Default for Varenv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_propagates_session_keys_only() {
        let mut env = Varenv::new();
        env.tid = Some("gw;1;aa;0".to_string());
        env.write_dateline = "g1:8100,42".to_string();
        env.policy = Some(PolicyChoice::Named("fast".to_string()));
        env.permission = Some("/boot/all_permission".to_string());
        env.user = Some("/user/alice".to_string());
        env.asof = Some("2009-01-01T00:00:00Z".to_string());

        let child = env.child();
        assert_eq!(child.tid, env.tid);
        assert_eq!(child.policy, env.policy);
        assert_eq!(child.lang, env.lang);
        assert_eq!(child.permission, env.permission);
        assert_eq!(child.user, env.user);

        // Restricted: dateline, asof, continuation state do not leak down.
        assert!(child.write_dateline.is_empty());
        assert!(child.asof.is_none());
        assert!(!child.is_write_continuation);
    }

    #[test]
    fn child_vars_used_propagates_upward() {
        let env = Varenv::new();
        env.use_var("$x");

        let child = env.child();
        child.use_var("$y");
        let grandchild = child.child();
        grandchild.use_var("$z");

        let seen = env.vars_used();
        assert!(seen.contains("$x"));
        assert!(seen.contains("$y"));
        assert!(seen.contains("$z"));
    }

    #[test]
    fn copy_detaches_vars_used() {
        let env = Varenv::new();
        env.use_var("$x");

        let copy = env.copy();
        copy.use_var("$y");

        assert!(copy.vars_used().contains("$x"));
        assert!(!env.vars_used().contains("$y"));
    }

    #[test]
    fn copy_preserves_dateline_state() {
        let mut env = Varenv::new();
        env.write_dateline = "g1:8100,42".to_string();
        env.is_write_continuation = true;

        let copy = env.copy();
        assert_eq!(copy.write_dateline, "g1:8100,42");
        assert!(copy.is_write_continuation);
    }
}
