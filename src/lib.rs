//! graphwire - client/transport library for graphd
//!
//! Speaks the line-oriented graphd protocol over TCP: renders request lines,
//! parses length-implicit s-expression reply frames, and drives policy-based
//! retry across a pool of server addresses.
//!
//! The pieces, bottom up:
//!   - [`reply`]: incremental frame scanner and s-expression parser
//!   - [`wire`]: one blocking socket with timeout-bounded connect/send/receive
//!   - [`pool`]: address selection with a shared failure window
//!   - [`policy`]: named and literal timeout/retry policies
//!   - [`connector`]: the retry state machine behind [`GraphConnector`]
//!   - [`varenv`]: per-request environment carrying the dateline contract
//!   - [`lookup`]: deferred, batched identifier translation
//!   - [`mock`]: record/replay connectors for tests
//!
//! A session holds one [`TcpConnector`] and one [`Varenv`]; reads issued
//! after a write in the same session are guaranteed to observe that write.

pub mod config;
pub mod connector;
pub mod cost;
pub mod error;
pub mod lookup;
pub mod mid;
pub mod mock;
pub mod policy;
pub mod pool;
pub mod reply;
pub mod tid;
pub mod varenv;
pub mod wire;

pub use config::ConnectorConfig;
pub use connector::{GraphConnector, TcpConnector};
pub use error::{GraphError, Result};
pub use lookup::{LookupHandle, LookupKind, LookupManager};
pub use mock::{MockRecordConnector, MockReplayConnector, MockStore};
pub use policy::{PolicyChoice, PolicyRegistry, PolicySpec, TimeoutPolicy};
pub use pool::{Address, AddressPool};
pub use reply::{Datum, Reply, ReplyStatus};
pub use varenv::Varenv;
