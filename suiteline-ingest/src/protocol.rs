//! Line-delimited JSON protocol for suite ingestion.
//!
//! Wire format, one object per line in each direction:
//! ```text
//! request   {"seq": 7, "cmd": "new_case", "payload": {...}}
//! response  {"seq": 7, "cmd": "created", "payload": {"id": "..."}}
//! error     {"seq": 7, "cmd": "case_not_found", "payload": {"cause": "..."}}
//! ```
//!
//! Every response echoes the `seq` of the request it answers. Requests whose
//! `seq` cannot be recovered are answered with `seq = 0`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use suiteline_store::{CaseArg, CaseStatus, EnvVar, FailureType, Link, LogLevel, SuiteStatus};

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: i64 = 1;

/// Command names.
pub mod cmd {
    pub const HELLO: &str = "hello";
    pub const NEW_SUITE: &str = "new_suite";
    pub const RECONNECT: &str = "reconnect";
    pub const NEW_CASE: &str = "new_case";
    pub const SET_CASE_STATUS: &str = "set_case_status";
    pub const NEW_LOG_ENTRY: &str = "new_log_entry";
    pub const SET_SUITE_STATUS: &str = "set_suite_status";

    pub const CREATED: &str = "created";
    pub const OK: &str = "ok";
}

/// Typed error responses. The wire name doubles as the response `cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadJson,
    BadCmd,
    BadPayload,
    BadVersion,
    BadStatus,
    SuiteNotReconnectable,
    CaseNotFound,
    /// Transient transport fault; the connection stays open.
    TmpIo,
    /// Opaque store or internal fault.
    Error,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadJson => "bad_json",
            ErrorKind::BadCmd => "bad_cmd",
            ErrorKind::BadPayload => "bad_payload",
            ErrorKind::BadVersion => "bad_version",
            ErrorKind::BadStatus => "bad_status",
            ErrorKind::SuiteNotReconnectable => "suite_not_reconnectable",
            ErrorKind::CaseNotFound => "case_not_found",
            ErrorKind::TmpIo => "tmp_io",
            ErrorKind::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "bad_json" => ErrorKind::BadJson,
            "bad_cmd" => ErrorKind::BadCmd,
            "bad_payload" => ErrorKind::BadPayload,
            "bad_version" => ErrorKind::BadVersion,
            "bad_status" => ErrorKind::BadStatus,
            "suite_not_reconnectable" => ErrorKind::SuiteNotReconnectable,
            "case_not_found" => ErrorKind::CaseNotFound,
            "tmp_io" => ErrorKind::TmpIo,
            "error" => ErrorKind::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn new(seq: i64, cmd: impl Into<String>, payload: Value) -> Self {
        Self {
            seq,
            cmd: cmd.into(),
            payload,
        }
    }

    /// Parse one line. On failure the error response is ready to send.
    pub fn parse(line: &str) -> Result<Self, Response> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Response::error(0, ErrorKind::BadJson, e.to_string()))?;
        let seq = value.get("seq").and_then(Value::as_i64).unwrap_or(0);
        serde_json::from_value(value)
            .map_err(|e| Response::error(seq, ErrorKind::BadJson, e.to_string()))
    }

    /// Decode the payload into a command-specific shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, Response> {
        T::deserialize(&self.payload)
            .map_err(|e| Response::error(self.seq, ErrorKind::BadPayload, e.to_string()))
    }
}

/// A server response or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn hello(seq: i64, version: i64) -> Self {
        Self {
            seq,
            cmd: cmd::HELLO.to_string(),
            payload: Some(json!({ "version": version })),
        }
    }

    pub fn created(seq: i64, id: &str) -> Self {
        Self {
            seq,
            cmd: cmd::CREATED.to_string(),
            payload: Some(json!({ "id": id })),
        }
    }

    pub fn ok(seq: i64) -> Self {
        Self {
            seq,
            cmd: cmd::OK.to_string(),
            payload: None,
        }
    }

    pub fn error(seq: i64, kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            seq,
            cmd: kind.as_str().to_string(),
            payload: Some(json!({ "cause": cause.into() })),
        }
    }

    /// The error kind, if this is an error response.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_wire(&self.cmd)
    }

    /// `payload.cause` of an error response.
    pub fn cause(&self) -> Option<&str> {
        self.payload.as_ref()?.get("cause")?.as_str()
    }

    /// `payload.id` of a `created` response.
    pub fn created_id(&self) -> Option<&str> {
        if self.cmd != cmd::CREATED {
            return None;
        }
        self.payload.as_ref()?.get("id")?.as_str()
    }

    /// Encode as one wire line, newline included.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

// ─── Payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSuitePayload {
    pub name: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub planned_cases: u32,
    /// Defaults to the time the server receives the command.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCasePayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub num: u32,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub args: Vec<CaseArg>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCaseStatusPayload {
    pub id: String,
    pub status: CaseStatus,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntryPayload {
    pub case: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default = "default_level")]
    pub level: LogLevel,
    #[serde(default)]
    pub trace: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSuiteStatusPayload {
    pub status: SuiteStatus,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}
