//! # suiteline-store: versioned document store for test telemetry
//!
//! Embedded storage for suites, cases, log lines and attachments, with
//! secondary indexes, soft deletion, cursor pagination and a synchronous
//! change bus.
//!
//! ## Architecture
//!
//! ```text
//!  writer (session)             readers (query API)
//!        │                             │
//!        ▼                             ▼
//! ┌──────────────────────────────────────────────┐
//! │ DocumentStore                                │
//! │   write lock ─► WriteBatch (record + index)  │
//! │   find / find_all / find_all_by / page       │
//! └──────┬──────────────────────────────┬────────┘
//!        │ RocksDB CFs                   │ publish (under write lock)
//!        ▼                               ▼
//!  attachments cases logs           ┌──────────┐
//!  suites indexes                   │ ChangeBus │──► watchers
//!                                   └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`]: shared record header and the `Entity`/`Patch` traits
//! - [`model`]: suites, cases, log lines, attachments and their patches
//! - [`codec`]: JSON + LZ4 record encoding
//! - [`id`]: time-ordered document ids
//! - [`index`]: secondary index declarations and key encoding
//! - [`store`]: the RocksDB document store
//! - [`bus`]: unbuffered change fan-out

pub mod bus;
pub mod codec;
pub mod entity;
pub mod error;
pub mod id;
pub mod index;
pub mod model;
pub mod store;

pub use bus::{Change, ChangeBus, Operation, Subscription};
pub use entity::{ChangedFields, Collection, Entity, Meta, Patch};
pub use error::{StoreError, StoreResult};
pub use id::IdGenerator;
pub use index::{Index, IndexEntry, IndexKey};
pub use model::{
    ArgValue, Attachment, AttachmentOwner, AttachmentPatch, AttachmentSource, Case, CaseArg,
    CasePatch, CaseStatus, EnvVar, FailureType, Link, LogLevel, LogLine, LogLinePatch, Suite,
    SuitePatch, SuiteStatus,
};
pub use store::{DocumentStore, Page, StoreConfig, SuiteCounts, SuitePage};
