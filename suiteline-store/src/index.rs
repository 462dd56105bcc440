//! Secondary index declarations and key encoding.
//!
//! All indexes share the `indexes` column family. An entry key is
//!
//! ```text
//! ┌─────┬──────────────────────────────┬────────┐
//! │ tag │ components (order-preserving)│ doc id │
//! │ 1 B │ text\0 | i64 BE | u64 BE … │ var    │
//! └─────┴──────────────────────────────┴────────┘
//! ```
//!
//! and its value is the document id. Components are encoded so that byte
//! order equals logical order, which lets range scans (forward or reverse)
//! walk an index in sorted order and lets an equality filter be expressed
//! as a key prefix.

use chrono::{DateTime, Utc};

use crate::entity::Collection;

/// Every index the store maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Index {
    /// suites by status
    SuitesByStatus = 1,
    /// suites by started_at (page order)
    SuitesByStartedAt = 2,
    /// cases by suite + num + created_at
    CasesBySuite = 3,
    /// logs by case + timestamp + seq
    LogsByCase = 4,
    /// attachments by owner + timestamp
    AttachmentsByOwner = 5,
}

impl Index {
    pub const ALL: [Index; 5] = [
        Index::SuitesByStatus,
        Index::SuitesByStartedAt,
        Index::CasesBySuite,
        Index::LogsByCase,
        Index::AttachmentsByOwner,
    ];

    /// The collection whose records this index points at.
    pub fn collection(self) -> Collection {
        match self {
            Index::SuitesByStatus | Index::SuitesByStartedAt => Collection::Suites,
            Index::CasesBySuite => Collection::Cases,
            Index::LogsByCase => Collection::Logs,
            Index::AttachmentsByOwner => Collection::Attachments,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Index::SuitesByStatus => "suites_by_status",
            Index::SuitesByStartedAt => "suites_by_started_at",
            Index::CasesBySuite => "cases_by_suite",
            Index::LogsByCase => "logs_by_case",
            Index::AttachmentsByOwner => "attachments_by_owner",
        }
    }

    /// Indexes declared against `collection`.
    pub fn declared_for(collection: Collection) -> impl Iterator<Item = Index> {
        Self::ALL
            .into_iter()
            .filter(move |idx| idx.collection() == collection)
    }

    fn tag(self) -> u8 {
        self as u8
    }
}

/// Order-preserving encoding of index key components.
///
/// Also used as an equality filter: a key built from the leading components
/// of an index matches every entry that starts with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// NUL-terminated text. Text components must not contain NUL.
    pub fn text(mut self, value: &str) -> Self {
        self.0.extend_from_slice(value.as_bytes());
        self.0.push(0);
        self
    }

    /// Timestamp at microsecond precision, sign bit flipped so negative
    /// instants sort before positive ones.
    pub fn time(mut self, value: DateTime<Utc>) -> Self {
        let micros = value.timestamp_micros() as u64 ^ (1 << 63);
        self.0.extend_from_slice(&micros.to_be_bytes());
        self
    }

    pub fn uint(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One index entry derived from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: Index,
    pub key: IndexKey,
}

impl IndexEntry {
    pub fn new(index: Index, key: IndexKey) -> Self {
        Self { index, key }
    }

    /// Full storage key: tag, components, document id.
    pub(crate) fn storage_key(&self, doc_id: &str) -> Vec<u8> {
        let mut key = scan_prefix(self.index, &self.key);
        key.extend_from_slice(doc_id.as_bytes());
        key
    }
}

/// Key prefix covering every entry of `index` that starts with `filter`.
pub(crate) fn scan_prefix(index: Index, filter: &IndexKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + filter.0.len() + 24);
    key.push(index.tag());
    key.extend_from_slice(&filter.0);
    key
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// `None` when the prefix is all `0xFF` (no such key exists).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_declared_indexes_per_collection() {
        let suites: Vec<Index> = Index::declared_for(Collection::Suites).collect();
        assert_eq!(suites, vec![Index::SuitesByStatus, Index::SuitesByStartedAt]);
        assert_eq!(Index::declared_for(Collection::Logs).count(), 1);
    }

    #[test]
    fn test_time_component_orders_chronologically() {
        let early = Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();

        let a = IndexKey::new().time(early);
        let b = IndexKey::new().time(mid);
        let c = IndexKey::new().time(late);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_text_component_is_prefix_safe() {
        // "ab" must not be a prefix match for "abc"
        let short = scan_prefix(Index::CasesBySuite, &IndexKey::new().text("ab"));
        let long = IndexEntry::new(Index::CasesBySuite, IndexKey::new().text("abc").uint(1))
            .storage_key("id1");
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn test_storage_key_layout() {
        let entry = IndexEntry::new(Index::SuitesByStatus, IndexKey::new().text("running"));
        let key = entry.storage_key("ff00");
        assert_eq!(key[0], Index::SuitesByStatus as u8);
        assert_eq!(&key[1..9], b"running\0");
        assert_eq!(&key[9..], b"ff00");
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_upper_bound(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
    }
}
