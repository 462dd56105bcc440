//! Common record shape shared by every stored entity.
//!
//! Every document carries a [`Meta`] header (`id`, `version`, soft-delete
//! flags) flattened next to its own fields, so a stored record is a single
//! self-describing JSON object:
//!
//! ```text
//! { "id": "…", "version": 3, "deleted": true, "deleted_at": "…", "name": "…", … }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::index::IndexEntry;

/// Field name → new value, as published on the change bus.
pub type ChangedFields = Map<String, Value>;

/// Storage collections. The string form doubles as the column family name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Attachments,
    Cases,
    Logs,
    Suites,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Attachments,
        Collection::Cases,
        Collection::Logs,
        Collection::Suites,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Attachments => "attachments",
            Collection::Cases => "cases",
            Collection::Logs => "logs",
            Collection::Suites => "suites",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity, version and soft-delete header of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A record type the store knows how to persist and index.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    /// The legally mutable fields of this entity.
    type Patch: Patch<Self>;

    fn meta(&self) -> &Meta;

    fn meta_mut(&mut self) -> &mut Meta;

    /// Secondary index entries for the record's current state.
    ///
    /// Recomputed on every write; the store swaps the old set for the new one
    /// inside the same batch as the primary write.
    fn index_entries(&self) -> Vec<IndexEntry>;

    fn id(&self) -> &str {
        &self.meta().id
    }

    fn version(&self) -> i64 {
        self.meta().version
    }

    fn is_deleted(&self) -> bool {
        self.meta().deleted
    }
}

/// A typed partial update.
///
/// Only fields that are `Some` are merged. `apply` reports the fields it
/// touched so the store can publish them.
pub trait Patch<E>: Send + Sync {
    fn is_empty(&self) -> bool;

    /// Caller expectation about the stored record, checked under the
    /// write lock before [`validate`](Self::validate).
    fn precondition(&self, _current: &E) -> Result<(), String> {
        Ok(())
    }

    /// Reject patches that would break an entity invariant.
    fn validate(&self, _current: &E) -> Result<(), String> {
        Ok(())
    }

    fn apply(&self, target: &mut E) -> serde_json::Result<ChangedFields>;
}

/// Record `value` under `name` in a changed-field map.
pub(crate) fn set_field<T: Serialize>(
    changed: &mut ChangedFields,
    name: &str,
    value: &T,
) -> serde_json::Result<()> {
    changed.insert(name.to_string(), serde_json::to_value(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        let names: Vec<&str> = Collection::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["attachments", "cases", "logs", "suites"]);
        assert_eq!(
            serde_json::to_string(&Collection::Logs).unwrap(),
            "\"logs\""
        );
    }

    #[test]
    fn test_meta_omits_delete_flags_when_live() {
        let meta = Meta {
            id: "a1".into(),
            version: 2,
            ..Meta::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({"id": "a1", "version": 2}));
    }
}
