//! Record/replay mock connectors
//!
//! Integration tests against a live graph are slow and flaky; most callers
//! want to record one real session and replay it forever. Both halves sit
//! behind the same [`GraphConnector`] trait as the real connector, so the
//! code under test cannot tell the difference.
//!
//! Exchanges are keyed by a blake3 hash of the canonicalized query: the
//! transaction id and any embedded timestamps are scrubbed first, so a
//! recorded session replays even though tids and clocks differ between runs.
//! When the same canonical query occurs more than once, occurrences get an
//! incrementing `#n` suffix, applied in the same order on record and replay.
//!
//! Replay feeds the stored raw reply bytes back through [`ReplyParser`], not
//! a shortcut deserialization. Whatever the parser did to the live bytes it
//! does to the replayed ones.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use regex_lite::Regex;
use tracing::debug;

use crate::connector::GraphConnector;
use crate::cost::{CostAccumulator, KEY_DBREQS};
use crate::error::{GraphError, Result};
use crate::reply::{Reply, ReplyParser, ReplyStatus};
use crate::varenv::Varenv;

const STORE_HEADER: &str = "graphwire-mock 1";

/// Scrubs run-specific noise out of a query before hashing.
#[derive(Debug)]
struct Scrubber {
    tid: Regex,
    timestamp: Regex,
}

impl Scrubber {
    fn new() -> Self {
        Self {
            tid: Regex::new(r#"id="[^"]*""#).unwrap(),
            timestamp: Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z").unwrap(),
        }
    }

    fn canonicalize(&self, mode: &str, query: &str) -> String {
        let scrubbed = self.tid.replace_all(query, r#"id="$$TID""#);
        let scrubbed = self.timestamp.replace_all(&scrubbed, "$$TIMESTAMP");
        format!("{} {}", mode, scrubbed.trim())
    }
}

/// Hash of a canonical query, plus the `#n` occurrence suffix for repeats.
fn occurrence_key(seen: &mut HashMap<String, usize>, canonical: &str) -> String {
    let hash = blake3::hash(canonical.as_bytes()).to_hex().to_string();
    let n = seen.entry(hash.clone()).or_insert(0);
    *n += 1;
    if *n == 1 {
        hash
    } else {
        format!("{}#{}", hash, *n - 1)
    }
}

// ============================================================================
// MockStore
// ============================================================================

#[derive(Debug, Clone)]
struct StoredExchange {
    canonical: String,
    raw: Vec<u8>,
}

/// Recorded exchanges, serializable to a line-oriented text format that
/// diffs cleanly under version control.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    entries: HashMap<String, StoredExchange>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, canonical: String, raw: Vec<u8>) {
        self.entries.insert(key, StoredExchange { canonical, raw });
    }

    pub fn raw(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|e| e.raw.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the text format. Entries are sorted by key so repeated
    /// recordings of the same session produce identical files.
    ///
    /// The raw reply is stored with an explicit byte length because reply
    /// frames may contain newlines inside quoted strings.
    pub fn serialize(&self) -> Result<String> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        let mut out = String::new();
        out.push_str(STORE_HEADER);
        out.push('\n');
        for key in keys {
            let entry = &self.entries[key];
            let raw = std::str::from_utf8(&entry.raw).map_err(|_| {
                GraphError::Parse(format!("reply for {} is not valid UTF-8", key))
            })?;
            out.push('\n');
            out.push_str(&format!("key {}\n", key));
            out.push_str(&format!("query {}\n", entry.canonical));
            out.push_str(&format!("reply {}\n", entry.raw.len()));
            out.push_str(raw);
        }
        Ok(out)
    }

    pub fn deserialize(text: &str) -> Result<Self> {
        let mut pos = 0;
        let header = next_line(text, &mut pos)
            .ok_or_else(|| GraphError::Parse("mock store is empty".to_string()))?;
        if header.trim_end() != STORE_HEADER {
            return Err(GraphError::Parse(format!(
                "unrecognized mock store header '{}'",
                header.trim_end()
            )));
        }

        let mut store = Self::new();
        while let Some(line) = next_line(text, &mut pos) {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let key = field(line, "key ")?;
            let canonical = field(
                next_line(text, &mut pos).unwrap_or_default().trim_end(),
                "query ",
            )?;
            let len: usize = field(
                next_line(text, &mut pos).unwrap_or_default().trim_end(),
                "reply ",
            )?
            .parse()
            .map_err(|_| GraphError::Parse("bad reply length in mock store".to_string()))?;

            let end = pos.checked_add(len).filter(|&end| end <= text.len()).ok_or_else(
                || GraphError::Parse(format!("truncated reply for key {}", key)),
            )?;
            let raw = text
                .get(pos..end)
                .ok_or_else(|| GraphError::Parse(format!("reply for key {} splits a character", key)))?;
            pos = end;

            store.insert(key.to_string(), canonical.to_string(), raw.as_bytes().to_vec());
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.serialize()?;
        fs::write(path, text)
            .map_err(|e| GraphError::Config(format!("writing mock store {}: {}", path.display(), e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GraphError::Config(format!("reading mock store {}: {}", path.display(), e)))?;
        Self::deserialize(&text)
    }
}

fn next_line<'a>(text: &'a str, pos: &mut usize) -> Option<&'a str> {
    if *pos >= text.len() {
        return None;
    }
    let rest = &text[*pos..];
    match rest.find('\n') {
        Some(i) => {
            *pos += i + 1;
            Some(&rest[..=i])
        }
        None => {
            *pos = text.len();
            Some(rest)
        }
    }
}

fn field<'a>(line: &'a str, prefix: &str) -> Result<&'a str> {
    line.strip_prefix(prefix).ok_or_else(|| {
        GraphError::Parse(format!("expected '{}...' in mock store, got '{}'", prefix, line))
    })
}

// ============================================================================
// Recording
// ============================================================================

/// Wraps a live connector and records every exchange that produced a
/// reply frame.
///
/// That includes error frames: a query error surfaced as [`GraphError::Mql`]
/// still has raw bytes behind it ([`GraphConnector::last_reply_raw`]), and
/// recording them lets the replayed session fail the same way the live one
/// did. Transport failures carry no frame and are not recorded.
pub struct MockRecordConnector<C> {
    inner: C,
    store: MockStore,
    scrubber: Scrubber,
    seen: HashMap<String, usize>,
}

impl<C: GraphConnector> MockRecordConnector<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            store: MockStore::new(),
            scrubber: Scrubber::new(),
            seen: HashMap::new(),
        }
    }

    pub fn store(&self) -> &MockStore {
        &self.store
    }

    pub fn into_store(self) -> MockStore {
        self.store
    }

    fn record(&mut self, mode: &str, query: &str, raw: Vec<u8>) {
        let canonical = self.scrubber.canonicalize(mode, query);
        let key = occurrence_key(&mut self.seen, &canonical);
        debug!(%key, "recorded exchange");
        self.store.insert(key, canonical, raw);
    }

    /// Record whatever frame backed this outcome, then pass it through.
    fn record_outcome(&mut self, mode: &str, query: &str, outcome: Result<Reply>) -> Result<Reply> {
        match outcome {
            Ok(reply) => {
                self.record(mode, query, reply.raw.clone());
                Ok(reply)
            }
            Err(e) => {
                // Only errors that came off the wire as a frame are worth
                // keeping; connection and timeout failures have none (or a
                // stale one from an earlier exchange).
                let frame_backed = matches!(
                    e,
                    GraphError::Mql { .. }
                        | GraphError::Snapshotting(_)
                        | GraphError::DatelineInvalid(_)
                );
                if frame_backed {
                    if let Some(raw) = self.inner.last_reply_raw().map(<[u8]>::to_vec) {
                        self.record(mode, query, raw);
                    }
                }
                Err(e)
            }
        }
    }
}

impl<C: GraphConnector> GraphConnector for MockRecordConnector<C> {
    fn read_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        let outcome = self.inner.read_varenv(query, varenv);
        self.record_outcome("read", query, outcome)
    }

    fn write_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        let outcome = self.inner.write_varenv(query, varenv);
        self.record_outcome("write", query, outcome)
    }

    fn status(&mut self, varenv: &mut Varenv, name: &str) -> Result<Reply> {
        let outcome = self.inner.status(varenv, name);
        self.record_outcome("status", name, outcome)
    }

    fn get_cost(&self) -> HashMap<String, f64> {
        self.inner.get_cost()
    }

    fn reset_cost(&mut self) {
        self.inner.reset_cost();
    }

    fn last_reply_raw(&self) -> Option<&[u8]> {
        self.inner.last_reply_raw()
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Serves recorded exchanges without touching the network.
pub struct MockReplayConnector {
    store: MockStore,
    scrubber: Scrubber,
    seen: HashMap<String, usize>,
    totalcost: CostAccumulator,
}

impl MockReplayConnector {
    pub fn new(store: MockStore) -> Self {
        Self {
            store,
            scrubber: Scrubber::new(),
            seen: HashMap::new(),
            totalcost: CostAccumulator::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(MockStore::load(path)?))
    }

    fn serve(&mut self, mode: &str, query: &str) -> Result<Reply> {
        let canonical = self.scrubber.canonicalize(mode, query);
        let key = occurrence_key(&mut self.seen, &canonical);
        let raw = self.store.raw(&key).ok_or_else(|| {
            GraphError::Config(format!("no recorded reply for '{}' (key {})", canonical, key))
        })?;

        // Through the real parser, exactly as the wire layer would.
        let mut parser = ReplyParser::new();
        parser.feed(raw);
        let reply = parser.take_reply()?;

        self.totalcost.absorb(&reply.cost);
        if reply.status == ReplyStatus::Ok {
            self.totalcost.bump(KEY_DBREQS);
            return Ok(reply);
        }

        // Recorded error frames come back as the same typed errors the
        // live connector would have produced.
        let code = reply.code.as_deref().unwrap_or("UNKNOWN");
        let message = reply.message.clone().unwrap_or_default();
        match code {
            "SNAPSHOT" => Err(GraphError::Snapshotting(message)),
            "DATELINE" => Err(GraphError::DatelineInvalid(message)),
            _ => Err(GraphError::Mql {
                code: code.to_string(),
                message,
            }),
        }
    }
}

impl GraphConnector for MockReplayConnector {
    fn read_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        let reply = self.serve("read", query)?;
        varenv.dateline = reply.dateline.clone();
        Ok(reply)
    }

    fn write_varenv(&mut self, query: &str, varenv: &mut Varenv) -> Result<Reply> {
        let reply = self.serve("write", query)?;
        varenv.write_dateline = reply.dateline.clone();
        varenv.last_write_time = Some(SystemTime::now());
        varenv.is_write_continuation = true;
        Ok(reply)
    }

    fn status(&mut self, _varenv: &mut Varenv, name: &str) -> Result<Reply> {
        self.serve("status", name)
    }

    fn get_cost(&self) -> HashMap<String, f64> {
        self.totalcost.snapshot()
    }

    fn reset_cost(&mut self) {
        self.totalcost.reset();
    }
}
