//! # suiteline-ingest: suite ingestion sessions over line-delimited JSON
//!
//! Test runners connect, say `hello`, open or resume a suite, then stream
//! cases, status changes and log lines until they report a final suite
//! status. Every command becomes a write to the
//! [`suiteline_store::DocumentStore`], and from there a change on its bus.
//!
//! ## Modules
//!
//! - [`protocol`]: request/response framing, payloads and error kinds
//! - [`session`]: the per-connection state machine
//! - [`tracker`]: detaching and reconnecting suites
//! - [`server`]: accept loop, stats and graceful shutdown

pub mod protocol;
pub mod server;
pub mod session;
pub mod tracker;

pub use protocol::{ErrorKind, Request, Response, PROTOCOL_VERSION};
pub use server::{Acceptor, IngestServer, PlainAcceptor, ServerConfig, ServerStats, StatsSnapshot};
pub use session::{OpError, Session, SessionConfig, SessionEnd, SessionState, StoreHandle};
pub use tracker::{Detachment, DetachmentTracker, ReconnectError};
