//! Test-execution records: suites, cases, log lines and attachments.
//!
//! Each record type comes with a patch type enumerating the only fields that
//! may change after insertion. Anything else is immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{set_field, ChangedFields, Collection, Entity, Meta, Patch};
use crate::index::{Index, IndexEntry, IndexKey};

// ─── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    Running,
    Passed,
    Failed,
    Disconnected,
}

impl SuiteStatus {
    pub const ALL: [SuiteStatus; 4] = [
        SuiteStatus::Running,
        SuiteStatus::Passed,
        SuiteStatus::Failed,
        SuiteStatus::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuiteStatus::Running => "running",
            SuiteStatus::Passed => "passed",
            SuiteStatus::Failed => "failed",
            SuiteStatus::Disconnected => "disconnected",
        }
    }

    /// Passed and failed are terminal.
    pub fn is_finished(&self) -> bool {
        matches!(self, SuiteStatus::Passed | SuiteStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Created,
    Disabled,
    Running,
    Passed,
    Failed,
    Errored,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Created => "created",
            CaseStatus::Disabled => "disabled",
            CaseStatus::Running => "running",
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::Errored => "errored",
        }
    }

    /// Anything past `created`/`running` is final.
    pub fn is_finished(&self) -> bool {
        !matches!(self, CaseStatus::Created | CaseStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// ─── Suite ────────────────────────────────────────────────────────

/// One entry of a suite's failure-type catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureType {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// One test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub planned_cases: u32,
    pub status: SuiteStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl Suite {
    /// A running suite with no cases planned.
    pub fn new(name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            meta: Meta::default(),
            name: name.into(),
            failure_types: Vec::new(),
            tags: Vec::new(),
            env_vars: Vec::new(),
            planned_cases: 0,
            status: SuiteStatus::Running,
            started_at,
            finished_at: None,
            disconnected_at: None,
        }
    }
}

/// Mutable suite fields. `disconnected_at: Some(None)` clears the stamp.
///
/// `expect_status` is not written: the update fails with
/// [`StoreError::Conflict`](crate::StoreError::Conflict) unless the stored
/// suite is live and has that status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuitePatch {
    pub status: Option<SuiteStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<Option<DateTime<Utc>>>,
    pub expect_status: Option<SuiteStatus>,
}

impl SuitePatch {
    pub fn status(mut self, status: SuiteStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn disconnected_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.disconnected_at = Some(at);
        self
    }

    pub fn require_status(mut self, status: SuiteStatus) -> Self {
        self.expect_status = Some(status);
        self
    }
}

impl Patch<Suite> for SuitePatch {
    fn is_empty(&self) -> bool {
        self.status.is_none() && self.finished_at.is_none() && self.disconnected_at.is_none()
    }

    fn precondition(&self, current: &Suite) -> Result<(), String> {
        match self.expect_status {
            Some(_) if current.meta.deleted => Err("suite is deleted".to_string()),
            Some(expected) if current.status != expected => Err(format!(
                "suite is {}, expected {}",
                current.status.as_str(),
                expected.as_str()
            )),
            _ => Ok(()),
        }
    }

    fn validate(&self, current: &Suite) -> Result<(), String> {
        match self.status {
            Some(next) if current.status.is_finished() && next != current.status => Err(format!(
                "suite {} is {} and cannot become {}",
                current.meta.id,
                current.status.as_str(),
                next.as_str()
            )),
            _ => Ok(()),
        }
    }

    fn apply(&self, target: &mut Suite) -> serde_json::Result<ChangedFields> {
        let mut changed = ChangedFields::new();
        if let Some(status) = self.status {
            target.status = status;
            set_field(&mut changed, "status", &status)?;
        }
        if let Some(at) = self.finished_at {
            target.finished_at = Some(at);
            set_field(&mut changed, "finished_at", &at)?;
        }
        if let Some(at) = self.disconnected_at {
            target.disconnected_at = at;
            set_field(&mut changed, "disconnected_at", &at)?;
        }
        Ok(changed)
    }
}

impl Entity for Suite {
    const COLLECTION: Collection = Collection::Suites;
    type Patch = SuitePatch;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(
                Index::SuitesByStatus,
                IndexKey::new().text(self.status.as_str()),
            ),
            IndexEntry::new(
                Index::SuitesByStartedAt,
                IndexKey::new().time(self.started_at),
            ),
        ]
    }
}

// ─── Case ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: String,
}

/// Typed argument value of a parametrised case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArg {
    pub key: String,
    pub value: ArgValue,
}

/// One test within a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(flatten)]
    pub meta: Meta,
    pub suite_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub num: u32,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub args: Vec<CaseArg>,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Case {
    pub fn new(
        suite_id: impl Into<String>,
        name: impl Into<String>,
        num: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: Meta::default(),
            suite_id: suite_id.into(),
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            num,
            links: Vec::new(),
            args: Vec::new(),
            status: CaseStatus::Created,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CasePatch {
    pub status: Option<CaseStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CasePatch {
    pub fn status(mut self, status: CaseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }
}

impl Patch<Case> for CasePatch {
    fn is_empty(&self) -> bool {
        self.status.is_none() && self.started_at.is_none() && self.finished_at.is_none()
    }

    fn validate(&self, current: &Case) -> Result<(), String> {
        if self.status == Some(CaseStatus::Created) && current.status != CaseStatus::Created {
            return Err(format!(
                "case {} cannot regress from {} to created",
                current.meta.id,
                current.status.as_str()
            ));
        }
        Ok(())
    }

    fn apply(&self, target: &mut Case) -> serde_json::Result<ChangedFields> {
        let mut changed = ChangedFields::new();
        if let Some(status) = self.status {
            target.status = status;
            set_field(&mut changed, "status", &status)?;
        }
        if let Some(at) = self.started_at {
            target.started_at = Some(at);
            set_field(&mut changed, "started_at", &at)?;
        }
        if let Some(at) = self.finished_at {
            target.finished_at = Some(at);
            set_field(&mut changed, "finished_at", &at)?;
        }
        Ok(changed)
    }
}

impl Entity for Case {
    const COLLECTION: Collection = Collection::Cases;
    type Patch = CasePatch;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::CasesBySuite,
            IndexKey::new()
                .text(&self.suite_id)
                .uint(u64::from(self.num))
                .time(self.created_at),
        )]
    }
}

// ─── LogLine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(flatten)]
    pub meta: Meta,
    pub case_id: String,
    pub seq: u64,
    pub level: LogLevel,
    #[serde(default)]
    pub trace: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Log lines are append-only; only soft deletion applies to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogLinePatch;

impl Patch<LogLine> for LogLinePatch {
    fn is_empty(&self) -> bool {
        true
    }

    fn apply(&self, _target: &mut LogLine) -> serde_json::Result<ChangedFields> {
        Ok(ChangedFields::new())
    }
}

impl Entity for LogLine {
    const COLLECTION: Collection = Collection::Logs;
    type Patch = LogLinePatch;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::LogsByCase,
            IndexKey::new()
                .text(&self.case_id)
                .time(self.timestamp)
                .uint(self.seq),
        )]
    }
}

// ─── Attachment ───────────────────────────────────────────────────

/// The single owner of an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentOwner {
    Suite(String),
    Case(String),
}

impl AttachmentOwner {
    pub fn id(&self) -> &str {
        match self {
            AttachmentOwner::Suite(id) | AttachmentOwner::Case(id) => id,
        }
    }
}

/// Where the payload lives. Bytes are never stored in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    Filename(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(flatten)]
    pub meta: Meta,
    pub owner: AttachmentOwner,
    pub source: AttachmentSource,
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentPatch {
    pub size: Option<u64>,
    pub content_type: Option<String>,
}

impl Patch<Attachment> for AttachmentPatch {
    fn is_empty(&self) -> bool {
        self.size.is_none() && self.content_type.is_none()
    }

    fn validate(&self, _current: &Attachment) -> Result<(), String> {
        match &self.content_type {
            Some(ct) if ct.trim().is_empty() => Err("content type must not be blank".to_string()),
            _ => Ok(()),
        }
    }

    fn apply(&self, target: &mut Attachment) -> serde_json::Result<ChangedFields> {
        let mut changed = ChangedFields::new();
        if let Some(size) = self.size {
            target.size = size;
            set_field(&mut changed, "size", &size)?;
        }
        if let Some(ct) = &self.content_type {
            target.content_type = ct.clone();
            set_field(&mut changed, "content_type", ct)?;
        }
        Ok(changed)
    }
}

impl Entity for Attachment {
    const COLLECTION: Collection = Collection::Attachments;
    type Patch = AttachmentPatch;

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            Index::AttachmentsByOwner,
            IndexKey::new().text(self.owner.id()).time(self.timestamp),
        )]
    }
}
