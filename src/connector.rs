//! Graph connector: one logical call -> zero or more wire exchanges
//!
//! [`TcpConnector`] turns `read`/`write`/`status` calls into framed requests
//! against the address pool, driving the policy's retry schedule and
//! maintaining two contracts that everything above depends on:
//!
//! - **Dateline consistency**: reads carry the session's `write_dateline` so
//!   they observe at least the session's own writes; writes never constrain
//!   themselves by a prior dateline and are the only operations that advance
//!   `write_dateline`.
//! - **Cost accounting**: every reply's cost string is folded into the
//!   running totals whether the exchange succeeded or failed, so a caller
//!   can always see what a request cost.
//!
//! Per-call states: Idle -> Connecting (when no live socket) -> Sending ->
//! Awaiting-Reply -> Success | Retry | Fatal. Retry loops back while the
//! schedule has entries; on exhaustion the last error propagates unchanged.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::config::ConnectorConfig;
use crate::cost::{CostAccumulator, KEY_DBREQS, KEY_RETRIES};
use crate::error::{GraphError, Result};
use crate::mid;
use crate::policy::{PolicyRegistry, TimeoutPolicy};
use crate::pool::{Address, AddressPool};
use crate::reply::{Reply, ReplyStatus};
use crate::tid::TidSource;
use crate::varenv::Varenv;
use crate::wire::WireConnection;

/// Request mode token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Status,
}

impl Mode {
    fn wire_token(self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
            Mode::Status => "status",
        }
    }
}

/// The connector contract. Implemented by [`TcpConnector`] and by the mock
/// record/replay connectors, which must be drop-in substitutes.
pub trait GraphConnector {
    fn read_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply>;
    fn write_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply>;
    /// Server status query; the reply body is the parsed status.
    fn status(&mut self, varenv: &mut Varenv, name: &str) -> Result<Reply>;
    fn get_cost(&self) -> HashMap<String, f64>;
    fn reset_cost(&mut self);

    /// Raw bytes of the most recent reply frame, including error frames
    /// that were surfaced as `Err`. The recording layer reads this to
    /// capture exchanges whose reply became a typed error.
    fn last_reply_raw(&self) -> Option<&[u8]> {
        None
    }
}

/// Validate a caller-supplied asof token: a guid or a timestamp.
pub fn validate_asof(token: &str) -> Result<()> {
    if mid::is_guid(token) || mid::is_timestamp(token) {
        Ok(())
    } else {
        Err(GraphError::Parse(format!(
            "asof must be a guid or timestamp, got '{}'",
            token
        )))
    }
}

/// True if an asof guid addresses a point at or before the session's
/// current write dateline. Dateline tokens order lexicographically within
/// one server epoch; a past asof can be cached indefinitely by consumers
/// since history does not change.
pub fn asof_is_past(asof: &str, write_dateline: &str) -> bool {
    !write_dateline.is_empty() && asof <= write_dateline
}

// ============================================================================
// TcpConnector
// ============================================================================

pub struct TcpConnector {
    config: ConnectorConfig,
    pool: AddressPool,
    conn: WireConnection,
    registry: PolicyRegistry,
    totalcost: CostAccumulator,
    tids: TidSource,
    /// Dateline from the most recent successful exchange, read or write.
    dateline: String,
    /// Frame bytes of the most recent reply, error frames included.
    last_raw: Option<Vec<u8>>,
}

impl TcpConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let pool = AddressPool::new(config.addresses.clone())?;
        Ok(Self::with_pool(config, pool))
    }

    /// Construct around an existing pool, e.g. one sharing a failure map
    /// with other sessions.
    pub fn with_pool(config: ConnectorConfig, pool: AddressPool) -> Self {
        Self {
            config,
            pool,
            conn: WireConnection::new(),
            registry: PolicyRegistry::with_builtins(),
            totalcost: CostAccumulator::new(),
            tids: TidSource::new(),
            dateline: String::new(),
            last_raw: None,
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn registry_mut(&mut self) -> &mut PolicyRegistry {
        &mut self.registry
    }

    /// Dateline of the most recent successful exchange.
    pub fn last_dateline(&self) -> &str {
        &self.dateline
    }

    pub fn close(&mut self) {
        self.conn.teardown();
    }

    // ------------------------------------------------------------------------
    // Request generation
    // ------------------------------------------------------------------------

    /// Render the complete request line: mode token, modifiers, body.
    fn render_request(&self, query: &str, varenv: &mut Varenv, mode: Mode) -> Result<String> {
        if varenv.tid.is_none() {
            varenv.tid = Some(self.tids.next_tid());
        }
        let tid = varenv.tid.as_deref().unwrap_or_default();

        let mut line = String::with_capacity(query.len() + 96);
        line.push_str(mode.wire_token());
        line.push_str(&format!(" id=\"{}\"", tid));

        if mode != Mode::Status {
            line.push_str(&format!(
                " cost=\"tu={}\"",
                self.config.default_query_timeout_tu
            ));
        }

        // Outgoing dateline: empty on writes (a write never constrains
        // itself by a prior dateline), the session floor on reads.
        if mode == Mode::Read && !varenv.write_dateline.is_empty() {
            line.push_str(&format!(" dateline=\"{}\"", varenv.write_dateline));
        }

        if mode == Mode::Read {
            if let Some(asof) = &varenv.asof {
                validate_asof(asof)?;
                if mid::is_guid(asof)
                    && !varenv.write_dateline.is_empty()
                    && !asof_is_past(asof, &varenv.write_dateline)
                {
                    warn!(
                        asof = %asof,
                        write_dateline = %varenv.write_dateline,
                        "asof is ahead of the session's write dateline"
                    );
                }
                line.push_str(&format!(" asof=\"{}\"", asof));
            }
        }

        if mode == Mode::Write && varenv.is_write_continuation {
            line.push_str(" continuation=\"1\"");
        }

        line.push(' ');
        line.push_str(query);
        line.push('\n');
        Ok(line)
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    fn generate_and_transmit(
        &mut self,
        query: &str,
        varenv: &mut Varenv,
        mode: Mode,
    ) -> Result<Reply> {
        let policy = self.registry.resolve(varenv.policy.as_ref())?;

        // Fail fast on an already-elapsed deadline: no sleep, no network.
        if let Some(deadline) = varenv.deadline {
            if Instant::now() >= deadline {
                return Err(GraphError::Timeout(
                    "request deadline elapsed before transmit".to_string(),
                ));
            }
        }

        let request = self.render_request(query, varenv, mode)?;
        self.transmit_with_retry(request.as_bytes(), &policy, varenv.deadline)
    }

    /// Drive the policy's retry schedule. Each schedule entry is one
    /// attempt; the entry's value is the backoff slept before it.
    fn transmit_with_retry(
        &mut self,
        request: &[u8],
        policy: &TimeoutPolicy,
        deadline: Option<Instant>,
    ) -> Result<Reply> {
        let mut last_err = GraphError::Config("retry schedule was empty".to_string());
        let mut avoid: Option<Address> = None;

        for (attempt, backoff) in policy.retry.iter().enumerate() {
            if attempt > 0 {
                self.totalcost.bump(KEY_RETRIES);
                self.sleep_backoff(*backoff, deadline)?;
            }

            if !self.conn.is_connected() {
                let addr = match &avoid {
                    Some(busy) => self.pool.pick_other(policy, busy),
                    None => self.pool.pick(policy),
                };
                let timeout = self.effective_timeout(policy.connect, deadline);
                if let Err(e) = self.conn.connect(&addr, timeout) {
                    debug!(addr = %addr, attempt, error = %e, "connect failed");
                    self.pool.record_failure(&addr);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = e;
                    continue;
                }
            }
            let addr = match self.conn.peer().cloned() {
                Some(addr) => addr,
                None => {
                    last_err = GraphError::ReadWrite("connection lost before send".to_string());
                    continue;
                }
            };

            let timeout = self.effective_timeout(policy.timeout, deadline);
            if let Err(e) = self.conn.send(request, timeout) {
                debug!(addr = %addr, attempt, error = %e, "send failed");
                self.pool.record_failure(&addr);
                if !e.is_retryable() {
                    return Err(e);
                }
                last_err = e;
                continue;
            }

            let reply = match self.conn.receive(self.effective_timeout(policy.timeout, deadline)) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(addr = %addr, attempt, error = %e, "receive failed");
                    self.pool.record_failure(&addr);
                    // A malformed frame (Parse) means this request will
                    // never round-trip; only transport errors are worth
                    // another attempt.
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = e;
                    continue;
                }
            };
            self.last_raw = Some(reply.raw.clone());

            // Costs from failed attempts are preserved even when the
            // terminal result is an error.
            self.totalcost.absorb(&reply.cost);

            if reply.status == ReplyStatus::Ok {
                self.totalcost.bump(KEY_DBREQS);
                self.dateline = reply.dateline.clone();
                return Ok(reply);
            }

            let code = reply.code.as_deref().unwrap_or("UNKNOWN");
            let message = reply.message.clone().unwrap_or_default();
            match code {
                // Snapshotting is per-node and transient: retry on a
                // different address, without marking this one failed.
                "SNAPSHOT" => {
                    debug!(addr = %addr, "node snapshotting; retrying elsewhere");
                    self.conn.teardown();
                    avoid = Some(addr);
                    last_err = GraphError::Snapshotting(message);
                    continue;
                }
                // Stale dateline is handled by the caller with one forced
                // retry; it is not part of this schedule.
                "DATELINE" => return Err(GraphError::DatelineInvalid(message)),
                // Anything else means the query itself is unservable.
                // Re-raise immediately rather than hammering every server
                // in the pool with it.
                _ => {
                    return Err(GraphError::Mql {
                        code: code.to_string(),
                        message,
                    })
                }
            }
        }

        Err(last_err)
    }

    /// One exchange plus the single forced dateline retry.
    fn exchange(&mut self, query: &str, varenv: &mut Varenv, mode: Mode) -> Result<Reply> {
        match self.generate_and_transmit(query, varenv, mode) {
            Err(GraphError::DatelineInvalid(message)) => {
                // The stored dateline references a server epoch that no
                // longer exists (typically a sandbox reset). Clear it and
                // retry exactly once; a second failure propagates.
                warn!(
                    dateline = %varenv.write_dateline,
                    %message,
                    "server rejected dateline; clearing and retrying once"
                );
                varenv.write_dateline.clear();
                let policy = self.registry.resolve(varenv.policy.as_ref())?;
                self.sleep_backoff(policy.dateline_retry, varenv.deadline)?;
                self.generate_and_transmit(query, varenv, mode)
            }
            other => other,
        }
    }

    /// Policy timeout clamped to the remaining deadline budget. A clamp
    /// down to zero flows to the wire layer's pre-flight rejection.
    fn effective_timeout(&self, secs: f64, deadline: Option<Instant>) -> Option<Duration> {
        if self.config.no_timeouts {
            return None;
        }
        let base = Duration::from_secs_f64(secs);
        match deadline {
            None => Some(base),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                Some(base.min(remaining))
            }
        }
    }

    /// Sleep a backoff interval, never past the deadline. An exhausted
    /// budget fails with Timeout instead of sleeping.
    fn sleep_backoff(&self, secs: f64, deadline: Option<Instant>) -> Result<()> {
        if secs <= 0.0 {
            return Ok(());
        }
        let mut pause = Duration::from_secs_f64(secs);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GraphError::Timeout(
                    "request deadline elapsed during backoff".to_string(),
                ));
            }
            pause = pause.min(remaining);
        }
        thread::sleep(pause);
        Ok(())
    }
}

impl GraphConnector for TcpConnector {
    fn read_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        let reply = self.exchange(query, varenv, Mode::Read)?;
        // Read-scoped output only; write_dateline is deliberately left
        // untouched so a read cannot rewind the session's freshness floor.
        varenv.dateline = reply.dateline.clone();
        Ok(reply)
    }

    fn write_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        if self.config.read_only {
            return Err(GraphError::ReadOnly);
        }
        let reply = self.exchange(query, varenv, Mode::Write)?;
        varenv.write_dateline = reply.dateline.clone();
        varenv.last_write_time = Some(SystemTime::now());
        varenv.is_write_continuation = true;
        Ok(reply)
    }

    fn status(&mut self, varenv: &mut Varenv, name: &str) -> Result<Reply> {
        let query = format!("({})", name);
        self.exchange(&query, varenv, Mode::Status)
    }

    fn get_cost(&self) -> HashMap<String, f64> {
        self.totalcost.snapshot()
    }

    fn reset_cost(&mut self) {
        self.totalcost.reset();
    }

    fn last_reply_raw(&self) -> Option<&[u8]> {
        self.last_raw.as_deref()
    }
}
