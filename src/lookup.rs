//! Deferred, batched identifier translation
//!
//! While a query structure is being built, every place that needs to turn
//! an id into a guid (or any of the other three directions) registers a
//! deferred lookup instead of resolving immediately. Once the query is
//! assembled, each queue is resolved with exactly one batched read. A query
//! referencing dozens of identifiers costs four round trips at most, not
//! dozens.
//!
//! A deferred lookup is a tagged state over an arena slot: `Pending` holds
//! only the known value, `Resolved` adds the translated one. Two deferrals
//! of the same (direction, known value) share one slot, so a query graph can
//! reference the same logical identifier from several places and see one
//! consistent resolution.

use std::collections::HashMap;

use tracing::debug;

use crate::connector::GraphConnector;
use crate::error::{GraphError, Result};
use crate::mid;
use crate::reply::Datum;
use crate::varenv::Varenv;

/// Translation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    IdToGuid,
    GuidToId,
    MidToGuid,
    GuidToMid,
}

impl LookupKind {
    fn wire_name(self) -> &'static str {
        match self {
            LookupKind::IdToGuid => "id->guid",
            LookupKind::GuidToId => "guid->id",
            LookupKind::MidToGuid => "mid->guid",
            LookupKind::GuidToMid => "guid->mid",
        }
    }

    fn queue_index(self) -> usize {
        match self {
            LookupKind::IdToGuid => 0,
            LookupKind::GuidToId => 1,
            LookupKind::MidToGuid => 2,
            LookupKind::GuidToMid => 3,
        }
    }
}

/// Index into the manager's arena. Copyable; many query nodes may hold the
/// same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupHandle(usize);

#[derive(Debug, Clone)]
enum LookupState {
    Pending,
    Resolved(String),
}

#[derive(Debug, Clone)]
struct DeferredLookup {
    kind: LookupKind,
    known: String,
    state: LookupState,
}

/// Arena of deferred lookups with one queue per direction.
#[derive(Debug, Clone, Default)]
pub struct LookupManager {
    arena: Vec<DeferredLookup>,
    index: HashMap<(LookupKind, String), LookupHandle>,
    queues: [Vec<LookupHandle>; 4],
    /// Deployment namespace (24 hex digits) for reconstructing guids from
    /// mids when the server has no record of one.
    mid_namespace: Option<String>,
}

impl LookupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deferred translation. Repeat registrations of the same
    /// (direction, known value) return the existing handle.
    pub fn defer(&mut self, kind: LookupKind, known: &str) -> LookupHandle {
        if let Some(&handle) = self.index.get(&(kind, known.to_string())) {
            return handle;
        }
        let handle = LookupHandle(self.arena.len());
        self.arena.push(DeferredLookup {
            kind,
            known: known.to_string(),
            state: LookupState::Pending,
        });
        self.index.insert((kind, known.to_string()), handle);
        self.queues[kind.queue_index()].push(handle);
        handle
    }

    /// Ids are free-form namespaced paths, so there is nothing to validate.
    pub fn defer_id_to_guid(&mut self, id: &str) -> LookupHandle {
        self.defer(LookupKind::IdToGuid, id)
    }

    pub fn defer_guid_to_id(&mut self, guid: &str) -> Result<LookupHandle> {
        if !mid::is_guid(guid) {
            return Err(GraphError::Parse(format!("not a guid: '{}'", guid)));
        }
        Ok(self.defer(LookupKind::GuidToId, guid))
    }

    pub fn defer_mid_to_guid(&mut self, token: &str) -> Result<LookupHandle> {
        if !mid::is_mid(token) {
            return Err(GraphError::Parse(format!("not a mid: '{}'", token)));
        }
        Ok(self.defer(LookupKind::MidToGuid, token))
    }

    pub fn defer_guid_to_mid(&mut self, guid: &str) -> Result<LookupHandle> {
        if !mid::is_guid(guid) {
            return Err(GraphError::Parse(format!("not a guid: '{}'", guid)));
        }
        Ok(self.defer(LookupKind::GuidToMid, guid))
    }

    /// Configure the deployment's 24-hex-digit guid namespace. With it set,
    /// a mid the server cannot resolve is reconstructed algorithmically
    /// instead of degrading to itself.
    pub fn set_mid_namespace(&mut self, namespace: impl Into<String>) {
        self.mid_namespace = Some(namespace.into());
    }

    /// The value supplied at registration.
    pub fn known(&self, handle: LookupHandle) -> &str {
        &self.arena[handle.0].known
    }

    /// The translated value.
    ///
    /// A lookup whose target was absent from the batch result degrades to
    /// its own input: the identifier "resolves to itself" rather than
    /// failing the whole query.
    pub fn resolved(&self, handle: LookupHandle) -> &str {
        match &self.arena[handle.0].state {
            LookupState::Resolved(value) => value,
            LookupState::Pending => &self.arena[handle.0].known,
        }
    }

    pub fn is_resolved(&self, handle: LookupHandle) -> bool {
        matches!(self.arena[handle.0].state, LookupState::Resolved(_))
    }

    /// Number of unresolved entries queued for one direction.
    pub fn pending(&self, kind: LookupKind) -> usize {
        self.queues[kind.queue_index()].len()
    }

    // ========================================================================
    // Batch resolution
    // ========================================================================

    pub fn do_id_lookups(&mut self, conn: &mut dyn GraphConnector, env: &mut Varenv) -> Result<()> {
        self.do_lookups(LookupKind::IdToGuid, conn, env)
    }

    pub fn do_guid_lookups(
        &mut self,
        conn: &mut dyn GraphConnector,
        env: &mut Varenv,
    ) -> Result<()> {
        self.do_lookups(LookupKind::GuidToId, conn, env)
    }

    pub fn do_mid_to_guid_lookups(
        &mut self,
        conn: &mut dyn GraphConnector,
        env: &mut Varenv,
    ) -> Result<()> {
        self.do_lookups(LookupKind::MidToGuid, conn, env)
    }

    pub fn do_guid_to_mid_lookups(
        &mut self,
        conn: &mut dyn GraphConnector,
        env: &mut Varenv,
    ) -> Result<()> {
        self.do_lookups(LookupKind::GuidToMid, conn, env)
    }

    /// Resolve one direction's queue with a single batched read.
    fn do_lookups(
        &mut self,
        kind: LookupKind,
        conn: &mut dyn GraphConnector,
        env: &mut Varenv,
    ) -> Result<()> {
        let queue = std::mem::take(&mut self.queues[kind.queue_index()]);
        if queue.is_empty() {
            return Ok(());
        }

        let mut query = format!("(resolve {} (", kind.wire_name());
        for (i, handle) in queue.iter().enumerate() {
            if i > 0 {
                query.push(' ');
            }
            query.push_str(&Datum::Str(self.known(*handle).to_string()).to_string());
        }
        query.push_str("))");

        debug!(kind = kind.wire_name(), batch = queue.len(), "batch lookup");
        let reply = conn.read_varenv(&query, env)?;
        self.fan_out(kind, &reply.body)?;
        self.derive_missing(kind, &queue);
        Ok(())
    }

    /// For the two mid directions, entries the server left unresolved are
    /// derived with the base-32 codec where that is possible (mid->guid
    /// needs the deployment namespace). Everything else keeps the
    /// resolve-to-self fallback.
    fn derive_missing(&mut self, kind: LookupKind, queue: &[LookupHandle]) {
        let namespace = self.mid_namespace.clone();
        for handle in queue {
            let slot = &mut self.arena[handle.0];
            if matches!(slot.state, LookupState::Resolved(_)) {
                continue;
            }
            let derived = match kind {
                LookupKind::GuidToMid => mid::mid_from_guid(&slot.known),
                LookupKind::MidToGuid => namespace
                    .as_deref()
                    .and_then(|ns| mid::guid_from_mid(&slot.known, ns)),
                _ => None,
            };
            if let Some(value) = derived {
                slot.state = LookupState::Resolved(value);
            }
        }
    }

    /// Distribute batch results back to arena slots by known value.
    fn fan_out(&mut self, kind: LookupKind, body: &Datum) -> Result<()> {
        let pairs = body
            .as_list()
            .ok_or_else(|| GraphError::Parse("lookup reply body is not a list".to_string()))?;
        for pair in pairs {
            let Some(items) = pair.as_list() else {
                return Err(GraphError::Parse(
                    "lookup reply entry is not a pair".to_string(),
                ));
            };
            let (Some(known), Some(resolved)) = (
                items.first().and_then(Datum::as_text),
                items.get(1).and_then(Datum::as_text),
            ) else {
                return Err(GraphError::Parse(
                    "lookup reply pair missing known/resolved value".to_string(),
                ));
            };
            if let Some(&handle) = self.index.get(&(kind, known.to_string())) {
                self.arena[handle.0].state = LookupState::Resolved(resolved.to_string());
            }
            // Results for identifiers we never asked about are ignored.
        }
        Ok(())
    }
}
