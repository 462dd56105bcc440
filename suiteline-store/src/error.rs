//! Storage errors.

use thiserror::Error;

use crate::entity::Collection;

/// Errors returned by [`crate::DocumentStore`].
///
/// `NotFound` is an ordinary result, never a panic: callers are expected to
/// match on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} document not found: {id}")]
    NotFound { collection: Collection, id: String },

    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid patch for {collection}: {reason}")]
    InvalidPatch {
        collection: Collection,
        reason: String,
    },

    #[error("{collection} document {id} conflicts: {reason}")]
    Conflict {
        collection: Collection,
        id: String,
        reason: String,
    },

    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),

    #[error("index {index} does not cover {collection}")]
    WrongIndex {
        index: &'static str,
        collection: Collection,
    },

    #[error("corrupt index entry in {0}")]
    CorruptIndex(&'static str),

    #[error("store write lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn not_found(collection: Collection, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
