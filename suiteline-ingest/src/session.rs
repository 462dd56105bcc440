//! Per-connection suite ingestion state machine.
//!
//! ```text
//! Hello ──hello{1}──► Entry ──new_suite / reconnect──► InProgress ──set_suite_status──► Finished
//!   ▲ bad_version       ▲ bad_cmd, suite_not_reconnectable    ▲ bad_cmd, bad_status, case_not_found
//!   └───────────────────┴──────────── stay ───────────────────┘
//! ```
//!
//! Requests are handled strictly one at a time. Errors are answered and the
//! state stays put; only `set_suite_status` ends a session. A connection that
//! ends in `Entry`/`InProgress` with a bound suite detaches that suite.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::watch;
use tokio::task::JoinError;

use suiteline_store::{
    Case, CasePatch, CaseStatus, DocumentStore, Index, IndexKey, LogLine, Meta, StoreError,
    StoreResult, Suite, SuitePatch, SuiteStatus,
};

use crate::protocol::{
    cmd, ErrorKind, HelloPayload, NewCasePayload, NewLogEntryPayload, NewSuitePayload,
    ReconnectPayload, Request, Response, SetCaseStatusPayload, SetSuiteStatusPayload,
    PROTOCOL_VERSION,
};
use crate::server::ServerStats;
use crate::tracker::{Detachment, ReconnectError};

/// Failure of a store call issued from a session.
#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store task failed: {0}")]
    Join(#[from] JoinError),
}

/// Runs synchronous store calls on the blocking pool under a deadline.
///
/// A call that times out keeps running to completion in the background;
/// only the session stops waiting for it.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<DocumentStore>,
    op_timeout: Duration,
}

impl StoreHandle {
    pub fn new(store: Arc<DocumentStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Run `op` and hand back whatever it returns.
    pub async fn run<T, F>(&self, op: F) -> Result<T, OpError>
    where
        F: FnOnce(&DocumentStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(joined) => Ok(joined?),
            Err(_) => Err(OpError::Timeout(self.op_timeout)),
        }
    }

    /// Run a fallible store operation, folding its error into [`OpError`].
    pub async fn call<T, F>(&self, op: F) -> Result<T, OpError>
    where
        F: FnOnce(&DocumentStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.run(op).await??)
    }
}

/// Session settings shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol_version: i64,
    pub reconnect_ttl: Duration,
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            reconnect_ttl: Duration::from_secs(300),
            max_line_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Hello,
    Entry,
    InProgress,
    Finished,
}

/// How a connection's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// `set_suite_status` was accepted.
    Finished,
    /// Peer closed, fatal I/O, or server shutdown.
    Disconnected,
}

pub struct Session {
    state: SessionState,
    suite_id: Option<String>,
    open_cases: HashSet<String>,
    store: StoreHandle,
    detachment: Detachment,
    config: SessionConfig,
}

impl Session {
    pub fn new(store: StoreHandle, detachment: Detachment, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Hello,
            suite_id: None,
            open_cases: HashSet::new(),
            store,
            detachment,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    /// The suite this session writes to, once bound.
    pub fn suite_id(&self) -> Option<&str> {
        self.suite_id.as_deref()
    }

    /// Cases still accepting status changes and log lines.
    pub fn open_cases(&self) -> &HashSet<String> {
        &self.open_cases
    }

    /// Handle one request and produce its response.
    pub async fn handle(&mut self, req: Request) -> Response {
        let state = self.state;
        let seq = req.seq;
        log::trace!("{state:?} <- {} #{seq}", req.cmd);
        let result = match state {
            SessionState::Hello => self.on_hello(&req),
            SessionState::Entry => self.on_entry(&req).await,
            SessionState::InProgress => self.on_in_progress(&req).await,
            SessionState::Finished => Err(bad_cmd(&req)),
        };
        let response = result.unwrap_or_else(|err| err);
        if let Some(kind) = response.error_kind() {
            log::warn!(
                "Rejected {} #{seq} in {state:?}: {kind} {}",
                req.cmd,
                response.cause().unwrap_or_default()
            );
        }
        response
    }

    /// The connection is gone. Detach the bound suite unless the session
    /// already finished. Returns `true` if a suite was detached.
    pub async fn on_disconnect(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        let Some(id) = self.suite_id.take() else {
            return false;
        };
        self.open_cases.clear();

        let detachment = self.detachment.clone();
        let ttl = self.config.reconnect_ttl;
        let now = Utc::now();
        let suite_id = id.clone();
        let result = self
            .store
            .call(move |store| detachment.detach(store, &suite_id, now, ttl))
            .await;
        match result {
            Ok(_) => {
                log::info!("Suite {id} detached");
                true
            }
            Err(e) => {
                log::error!("Failed to detach suite {id}: {e}");
                false
            }
        }
    }

    // ─── Hello ────────────────────────────────────────────────────

    fn on_hello(&mut self, req: &Request) -> Result<Response, Response> {
        if req.cmd != cmd::HELLO {
            return Err(bad_cmd(req));
        }
        let hello: HelloPayload = req.payload()?;
        if hello.version != self.config.protocol_version {
            return Err(Response::error(
                req.seq,
                ErrorKind::BadVersion,
                format!(
                    "unsupported version {}, expected {}",
                    hello.version, self.config.protocol_version
                ),
            ));
        }
        self.state = SessionState::Entry;
        Ok(Response::hello(req.seq, self.config.protocol_version))
    }

    // ─── Entry ────────────────────────────────────────────────────

    async fn on_entry(&mut self, req: &Request) -> Result<Response, Response> {
        match req.cmd.as_str() {
            cmd::NEW_SUITE => self.new_suite(req).await,
            cmd::RECONNECT => self.reconnect(req).await,
            _ => Err(bad_cmd(req)),
        }
    }

    async fn new_suite(&mut self, req: &Request) -> Result<Response, Response> {
        let p: NewSuitePayload = req.payload()?;
        let mut suite = Suite::new(p.name, p.started_at.unwrap_or_else(Utc::now));
        suite.failure_types = p.failure_types;
        suite.tags = p.tags;
        suite.env_vars = p.env_vars;
        suite.planned_cases = p.planned_cases;

        let abandoned = Arc::new(AtomicBool::new(false));
        let late = abandoned.clone();
        let inserted = self
            .store
            .call(move |store| {
                let id = store.insert(suite)?;
                if late.load(Ordering::Acquire) {
                    log::warn!(
                        "Suite {id} inserted after its session timed out; no session owns it"
                    );
                }
                Ok(id)
            })
            .await;
        if matches!(inserted, Err(OpError::Timeout(_))) {
            abandoned.store(true, Ordering::Release);
        }
        let id = inserted.map_err(|e| internal(req.seq, e))?;

        log::info!("Suite {id} started");
        self.suite_id = Some(id.clone());
        self.state = SessionState::InProgress;
        Ok(Response::created(req.seq, &id))
    }

    async fn reconnect(&mut self, req: &Request) -> Result<Response, Response> {
        let p: ReconnectPayload = req.payload()?;
        let detachment = self.detachment.clone();
        let ttl = self.config.reconnect_ttl;
        let now = Utc::now();
        let id = p.id.clone();

        let resumed = self
            .store
            .run(move |store| -> Result<Vec<Case>, ReconnectError> {
                detachment.reconnect(store, &id, now, ttl)?;
                let cases: Vec<Case> = store
                    .find_all_by(Index::CasesBySuite, &IndexKey::new().text(&id), false)
                    .map_err(ReconnectError::Store)?;
                Ok(cases)
            })
            .await
            .map_err(|e| internal(req.seq, e))?;

        let cases = match resumed {
            Ok(cases) => cases,
            Err(ReconnectError::Store(e)) => return Err(internal(req.seq, e)),
            Err(e) => {
                return Err(Response::error(
                    req.seq,
                    ErrorKind::SuiteNotReconnectable,
                    e.to_string(),
                ))
            }
        };

        self.open_cases = cases
            .into_iter()
            .filter(|c| !c.status.is_finished())
            .map(|c| c.meta.id)
            .collect();
        log::info!(
            "Suite {} reconnected with {} open cases",
            p.id,
            self.open_cases.len()
        );
        self.suite_id = Some(p.id.clone());
        self.state = SessionState::InProgress;
        Ok(Response::created(req.seq, &p.id))
    }

    // ─── InProgress ───────────────────────────────────────────────

    async fn on_in_progress(&mut self, req: &Request) -> Result<Response, Response> {
        match req.cmd.as_str() {
            cmd::NEW_CASE => self.new_case(req).await,
            cmd::SET_CASE_STATUS => self.set_case_status(req).await,
            cmd::NEW_LOG_ENTRY => self.new_log_entry(req).await,
            cmd::SET_SUITE_STATUS => self.set_suite_status(req).await,
            _ => Err(bad_cmd(req)),
        }
    }

    fn bound_suite(&self, seq: i64) -> Result<String, Response> {
        self.suite_id
            .clone()
            .ok_or_else(|| Response::error(seq, ErrorKind::Error, "no suite bound to session"))
    }

    async fn new_case(&mut self, req: &Request) -> Result<Response, Response> {
        let p: NewCasePayload = req.payload()?;
        let suite_id = self.bound_suite(req.seq)?;
        let created_at = p.created_at.unwrap_or_else(Utc::now);

        let mut case = Case::new(suite_id, p.name, p.num, created_at);
        case.description = p.description;
        case.tags = p.tags;
        case.links = p.links;
        case.args = p.args;
        if p.disabled {
            case.status = CaseStatus::Disabled;
            case.started_at = Some(created_at);
            case.finished_at = Some(created_at);
        }

        let id = self
            .store
            .call(move |store| store.insert(case))
            .await
            .map_err(|e| internal(req.seq, e))?;

        if !p.disabled {
            self.open_cases.insert(id.clone());
        }
        log::debug!("Case {id} created (disabled: {})", p.disabled);
        Ok(Response::created(req.seq, &id))
    }

    async fn set_case_status(&mut self, req: &Request) -> Result<Response, Response> {
        let p: SetCaseStatusPayload = req.payload()?;
        if p.status == CaseStatus::Created {
            return Err(Response::error(
                req.seq,
                ErrorKind::BadStatus,
                "a case cannot return to created",
            ));
        }
        if !self.open_cases.contains(&p.id) {
            return Err(case_not_found(req.seq, &p.id));
        }

        let at = p.at.unwrap_or_else(Utc::now);
        let mut patch = CasePatch::default().status(p.status);
        if matches!(p.status, CaseStatus::Running | CaseStatus::Disabled) {
            patch = patch.started_at(at);
        }
        if p.status != CaseStatus::Running {
            patch = patch.finished_at(at);
        }

        let id = p.id.clone();
        let result = self
            .store
            .call(move |store| store.update::<Case>(&id, &patch))
            .await;
        match result {
            Ok(_) => {}
            Err(OpError::Store(e)) if e.is_not_found() => {
                self.open_cases.remove(&p.id);
                return Err(case_not_found(req.seq, &p.id));
            }
            Err(OpError::Store(StoreError::InvalidPatch { reason, .. })) => {
                return Err(Response::error(req.seq, ErrorKind::BadStatus, reason));
            }
            Err(e) => return Err(internal(req.seq, e)),
        }

        if p.status != CaseStatus::Running {
            self.open_cases.remove(&p.id);
        }
        log::debug!("Case {} -> {}", p.id, p.status.as_str());
        Ok(Response::ok(req.seq))
    }

    async fn new_log_entry(&mut self, req: &Request) -> Result<Response, Response> {
        let p: NewLogEntryPayload = req.payload()?;
        if !self.open_cases.contains(&p.case) {
            return Err(case_not_found(req.seq, &p.case));
        }

        let line = LogLine {
            meta: Meta::default(),
            case_id: p.case,
            seq: p.seq,
            level: p.level,
            trace: p.trace,
            message: p.message,
            timestamp: p.timestamp.unwrap_or_else(Utc::now),
        };
        self.store
            .call(move |store| store.insert(line))
            .await
            .map_err(|e| internal(req.seq, e))?;
        Ok(Response::ok(req.seq))
    }

    async fn set_suite_status(&mut self, req: &Request) -> Result<Response, Response> {
        let p: SetSuiteStatusPayload = req.payload()?;
        if !p.status.is_finished() {
            return Err(Response::error(
                req.seq,
                ErrorKind::BadStatus,
                format!("suite status must be passed or failed, got {}", p.status.as_str()),
            ));
        }
        let suite_id = self.bound_suite(req.seq)?;
        let at = p.at.unwrap_or_else(Utc::now);
        let status = p.status;

        let finalized = self
            .store
            .call(move |store| finish_suite(store, &suite_id, status, at))
            .await
            .map_err(|e| internal(req.seq, e))?;

        log::info!(
            "Suite {} finished {} ({finalized} unfinished cases errored)",
            self.suite_id().unwrap_or_default(),
            status.as_str()
        );
        self.open_cases.clear();
        self.state = SessionState::Finished;
        Ok(Response::ok(req.seq))
    }

    // ─── Connection loop ──────────────────────────────────────────

    /// Drive the session over `stream` until it finishes, the peer leaves,
    /// or `shutdown` flips.
    pub async fn run<S>(
        mut self,
        stream: S,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<ServerStats>,
    ) -> io::Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let limit = self.config.max_line_bytes;

        let outcome: io::Result<()> = loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader, &mut buf, limit) => frame,
                _ = shutdown.changed() => {
                    log::debug!("Session closing for shutdown");
                    break Ok(());
                }
            };

            let response = match frame {
                Ok(Frame::Eof) => break Ok(()),
                Ok(Frame::TooLong) => Response::error(
                    0,
                    ErrorKind::BadJson,
                    format!("line exceeds {limit} bytes"),
                ),
                Ok(Frame::Line) => match std::str::from_utf8(&buf) {
                    Ok(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        stats.requests.fetch_add(1, Ordering::Relaxed);
                        match Request::parse(line) {
                            Ok(req) => self.handle(req).await,
                            Err(resp) => resp,
                        }
                    }
                    Err(e) => {
                        stats.requests.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Rejected non UTF-8 line: {e}");
                        Response::error(0, ErrorKind::BadJson, format!("invalid UTF-8: {e}"))
                    }
                },
                Err(e) if is_transient(&e) => {
                    log::warn!("Transient read fault: {e}");
                    Response::error(0, ErrorKind::TmpIo, e.to_string())
                }
                Err(e) => break Err(e),
            };

            // A peer that stops reading must not hold up shutdown
            let written = tokio::select! {
                written = write_response(&mut writer, &response) => written,
                _ = shutdown.changed() => {
                    log::debug!("Session closing for shutdown with a response unsent");
                    break Ok(());
                }
            };
            if let Err(e) = written {
                if is_transient(&e) {
                    log::warn!("Transient write fault: {e}");
                    continue;
                }
                break Err(e);
            }

            if self.is_finished() {
                let _ = writer.shutdown().await;
                return Ok(SessionEnd::Finished);
            }
        };

        if self.on_disconnect().await {
            stats.detached_sessions.fetch_add(1, Ordering::Relaxed);
        }
        outcome.map(|_| SessionEnd::Disconnected)
    }
}

/// Set the suite's terminal status, then error out every unfinished case.
/// Returns how many cases were finalized.
fn finish_suite(
    store: &DocumentStore,
    suite_id: &str,
    status: SuiteStatus,
    at: DateTime<Utc>,
) -> StoreResult<usize> {
    let patch = SuitePatch::default().status(status).finished_at(at);
    store.update::<Suite>(suite_id, &patch)?;

    let cases: Vec<Case> =
        store.find_all_by(Index::CasesBySuite, &IndexKey::new().text(suite_id), false)?;
    let errored = CasePatch::default()
        .status(CaseStatus::Errored)
        .finished_at(at);
    let mut finalized = 0;
    for case in cases.iter().filter(|c| !c.status.is_finished()) {
        store.update::<Case>(&case.meta.id, &errored)?;
        finalized += 1;
    }
    Ok(finalized)
}

fn bad_cmd(req: &Request) -> Response {
    Response::error(
        req.seq,
        ErrorKind::BadCmd,
        format!("unexpected command '{}'", req.cmd),
    )
}

fn case_not_found(seq: i64, id: &str) -> Response {
    Response::error(seq, ErrorKind::CaseNotFound, format!("case {id} is not open"))
}

fn internal(seq: i64, err: impl std::fmt::Display) -> Response {
    log::error!("Store fault: {err}");
    Response::error(seq, ErrorKind::Error, err.to_string())
}

// ─── Framing ──────────────────────────────────────────────────────

enum Frame {
    /// A complete line is in the buffer.
    Line,
    /// The line exceeded the limit and was discarded.
    TooLong,
    Eof,
}

/// Read one newline-terminated line of at most `limit` bytes into `buf`.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= limit {
        return Ok(Frame::Line);
    }

    // Skip the rest of the oversized line
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                break;
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
    buf.clear();
    Ok(Frame::TooLong)
}

async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    log::trace!("-> {} #{}", response.cmd, response.seq);
    let line = response.to_line().map_err(io::Error::other)?;
    writer.write_all(&line).await?;
    writer.flush().await
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use suiteline_store::StoreConfig;
    use tempfile::TempDir;

    fn open(detachment: Detachment) -> (TempDir, Arc<DocumentStore>, Session) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let handle = StoreHandle::new(store.clone(), Duration::from_secs(5));
        let session = Session::new(handle, detachment, SessionConfig::default());
        (dir, store, session)
    }

    fn new_session(store: &Arc<DocumentStore>) -> Session {
        Session::new(
            StoreHandle::new(store.clone(), Duration::from_secs(5)),
            Detachment::Persisted,
            SessionConfig::default(),
        )
    }

    async fn send(session: &mut Session, seq: i64, cmd: &str, payload: serde_json::Value) -> Response {
        let resp = session.handle(Request::new(seq, cmd, payload)).await;
        assert_eq!(resp.seq, seq);
        resp
    }

    async fn start_suite(session: &mut Session) -> String {
        send(session, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(session, 2, cmd::NEW_SUITE, json!({"name": "nightly"})).await;
        resp.created_id().unwrap().to_string()
    }

    async fn new_case(session: &mut Session, seq: i64, disabled: bool) -> String {
        let resp = send(
            session,
            seq,
            cmd::NEW_CASE,
            json!({"name": format!("case{seq}"), "num": seq, "disabled": disabled}),
        )
        .await;
        resp.created_id().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_hello_rejects_other_versions_and_retries() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        let resp = send(&mut session, 1, cmd::HELLO, json!({"version": 2})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadVersion));
        assert_eq!(session.state(), SessionState::Hello);

        let resp = send(&mut session, 2, cmd::NEW_SUITE, json!({"name": "s"})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadCmd));

        let resp = send(&mut session, 3, cmd::HELLO, json!({"version": 1})).await;
        assert_eq!(resp.cmd, cmd::HELLO);
        assert_eq!(resp.payload.unwrap()["version"], 1);
        assert_eq!(session.state(), SessionState::Entry);
    }

    #[tokio::test]
    async fn test_hello_bad_payload() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        let resp = send(&mut session, 1, cmd::HELLO, json!({"version": "one"})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadPayload));
        assert_eq!(session.state(), SessionState::Hello);
    }

    #[tokio::test]
    async fn test_entry_rejects_case_commands() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        send(&mut session, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(&mut session, 2, cmd::NEW_CASE, json!({"name": "c"})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadCmd));
        assert_eq!(session.state(), SessionState::Entry);
    }

    #[tokio::test]
    async fn test_disabled_case_never_opens() {
        let (_dir, store, mut session) = open(Detachment::Persisted);
        start_suite(&mut session).await;
        let id = new_case(&mut session, 3, true).await;
        assert!(session.open_cases().is_empty());

        let case: Case = store.find(&id).unwrap();
        assert_eq!(case.status, CaseStatus::Disabled);
        assert_eq!(case.started_at, Some(case.created_at));
        assert_eq!(case.finished_at, Some(case.created_at));

        let resp = send(
            &mut session,
            4,
            cmd::SET_CASE_STATUS,
            json!({"id": id, "status": "running"}),
        )
        .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::CaseNotFound));
    }

    #[tokio::test]
    async fn test_created_status_always_rejected() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        start_suite(&mut session).await;
        let id = new_case(&mut session, 3, false).await;

        for (seq, target) in [(4, "created"), (6, "created")] {
            let resp = send(
                &mut session,
                seq,
                cmd::SET_CASE_STATUS,
                json!({"id": id, "status": target}),
            )
            .await;
            assert_eq!(resp.error_kind(), Some(ErrorKind::BadStatus));
            let running = json!({"id": id, "status": "running"});
            send(&mut session, seq + 1, cmd::SET_CASE_STATUS, running).await;
        }
        // Unknown ids are rejected as created too, before the lookup
        let resp = send(
            &mut session,
            8,
            cmd::SET_CASE_STATUS,
            json!({"id": "nope", "status": "created"}),
        )
        .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadStatus));
    }

    #[tokio::test]
    async fn test_case_timestamps_follow_status() {
        let (_dir, store, mut session) = open(Detachment::Persisted);
        start_suite(&mut session).await;
        let id = new_case(&mut session, 3, false).await;

        let resp = send(
            &mut session,
            4,
            cmd::SET_CASE_STATUS,
            json!({"id": id, "status": "running", "at": "2024-01-01T00:00:00Z"}),
        )
        .await;
        assert_eq!(resp.cmd, cmd::OK);
        let case: Case = store.find(&id).unwrap();
        assert!(case.started_at.is_some());
        assert!(case.finished_at.is_none());
        assert!(session.open_cases().contains(&id));

        send(
            &mut session,
            5,
            cmd::SET_CASE_STATUS,
            json!({"id": id, "status": "failed", "at": "2024-01-01T00:01:00Z"}),
        )
        .await;
        let case: Case = store.find(&id).unwrap();
        assert_eq!(case.status, CaseStatus::Failed);
        assert_eq!(case.finished_at.unwrap().to_rfc3339(), "2024-01-01T00:01:00+00:00");
        assert!(!session.open_cases().contains(&id));

        // Closed cases take no more logs
        let resp = send(
            &mut session,
            6,
            cmd::NEW_LOG_ENTRY,
            json!({"case": id, "message": "late"}),
        )
        .await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::CaseNotFound));
    }

    #[tokio::test]
    async fn test_suite_status_must_be_terminal() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        start_suite(&mut session).await;
        for (seq, status) in [(3, "running"), (4, "disconnected")] {
            let resp = send(&mut session, seq, cmd::SET_SUITE_STATUS, json!({"status": status})).await;
            assert_eq!(resp.error_kind(), Some(ErrorKind::BadStatus));
        }
        assert_eq!(session.state(), SessionState::InProgress);
    }

    #[tokio::test]
    async fn test_finishing_suite_errors_open_cases() {
        let (_dir, store, mut session) = open(Detachment::Persisted);
        let suite_id = start_suite(&mut session).await;
        let waiting = new_case(&mut session, 3, false).await;
        let running = new_case(&mut session, 4, false).await;
        let passed = new_case(&mut session, 5, false).await;
        send(&mut session, 6, cmd::SET_CASE_STATUS, json!({"id": running, "status": "running"})).await;
        send(&mut session, 7, cmd::SET_CASE_STATUS, json!({"id": passed, "status": "passed"})).await;

        let resp = send(&mut session, 8, cmd::SET_SUITE_STATUS, json!({"status": "failed"})).await;
        assert_eq!(resp.cmd, cmd::OK);
        assert!(session.is_finished());

        let suite: Suite = store.find(&suite_id).unwrap();
        assert_eq!(suite.status, SuiteStatus::Failed);
        assert!(suite.finished_at.is_some());
        for id in [&waiting, &running] {
            let case: Case = store.find(id).unwrap();
            assert_eq!(case.status, CaseStatus::Errored);
            assert_eq!(case.finished_at, suite.finished_at);
        }
        assert_eq!(store.find::<Case>(&passed).unwrap().status, CaseStatus::Passed);

        // Finished sessions accept nothing and do not detach
        let resp = send(&mut session, 9, cmd::NEW_CASE, json!({"name": "x"})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::BadCmd));
        assert!(!session.on_disconnect().await);
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_restores_open_cases() {
        let (_dir, store, mut session) = open(Detachment::Persisted);
        let suite_id = start_suite(&mut session).await;
        let open_a = new_case(&mut session, 3, false).await;
        let open_b = new_case(&mut session, 4, false).await;
        let done = new_case(&mut session, 5, false).await;
        new_case(&mut session, 6, true).await;
        send(&mut session, 7, cmd::SET_CASE_STATUS, json!({"id": open_b, "status": "running"})).await;
        send(&mut session, 8, cmd::SET_CASE_STATUS, json!({"id": done, "status": "passed"})).await;

        assert!(session.on_disconnect().await);
        let suite: Suite = store.find(&suite_id).unwrap();
        assert_eq!(suite.status, SuiteStatus::Disconnected);

        let mut resumed = new_session(&store);
        send(&mut resumed, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(&mut resumed, 2, cmd::RECONNECT, json!({"id": suite_id})).await;
        assert_eq!(resp.created_id(), Some(suite_id.as_str()));

        let expected: HashSet<String> = [open_a, open_b].into_iter().collect();
        assert_eq!(resumed.open_cases(), &expected);
        assert_eq!(store.find::<Suite>(&suite_id).unwrap().status, SuiteStatus::Running);
    }

    #[tokio::test]
    async fn test_reconnect_running_suite_rejected() {
        let (_dir, store, mut session) = open(Detachment::Persisted);
        let suite_id = start_suite(&mut session).await;

        let mut other = new_session(&store);
        send(&mut other, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(&mut other, 2, cmd::RECONNECT, json!({"id": suite_id})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::SuiteNotReconnectable));
        assert_eq!(resp.cause(), Some("not disconnected"));
        assert_eq!(other.state(), SessionState::Entry);

        let resp = send(&mut other, 3, cmd::RECONNECT, json!({"id": "missing"})).await;
        assert_eq!(resp.cause(), Some("not found"));
    }

    #[tokio::test]
    async fn test_reconnect_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let config = SessionConfig {
            reconnect_ttl: Duration::ZERO,
            ..SessionConfig::default()
        };
        let handle = StoreHandle::new(store.clone(), Duration::from_secs(5));
        let mut session = Session::new(handle.clone(), Detachment::Persisted, config.clone());
        let suite_id = start_suite(&mut session).await;
        assert!(session.on_disconnect().await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut late = Session::new(handle, Detachment::Persisted, config);
        send(&mut late, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(&mut late, 2, cmd::RECONNECT, json!({"id": suite_id})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::SuiteNotReconnectable));
        assert_eq!(resp.cause(), Some("expired"));
    }

    #[tokio::test]
    async fn test_disconnect_before_suite_is_noop() {
        let (_dir, _store, mut session) = open(Detachment::Persisted);
        send(&mut session, 1, cmd::HELLO, json!({"version": 1})).await;
        assert!(!session.on_disconnect().await);
    }

    #[tokio::test]
    async fn test_store_handle_timeout() {
        let (_dir, store, _session) = open(Detachment::Persisted);
        let handle = StoreHandle::new(store, Duration::from_millis(10));
        let err = handle
            .run(|_| std::thread::sleep(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stalled_store_answers_error() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let mut session = Session::new(
            StoreHandle::new(store.clone(), Duration::from_millis(200)),
            Detachment::Persisted,
            SessionConfig::default(),
        );
        // Never read, so the next write blocks in publish
        let stalled = store.changes();

        send(&mut session, 1, cmd::HELLO, json!({"version": 1})).await;
        let resp = send(&mut session, 2, cmd::NEW_SUITE, json!({"name": "s"})).await;
        assert_eq!(resp.error_kind(), Some(ErrorKind::Error));
        assert!(resp.cause().unwrap().contains("timed out"));
        assert_eq!(session.state(), SessionState::Entry);
        assert!(session.suite_id().is_none());

        drop(stalled);
        // The abandoned insert still lands
        let mut suites: Vec<Suite> = Vec::new();
        for _ in 0..100 {
            suites = store.find_all(Index::SuitesByStartedAt, false).unwrap();
            if store.bus().subscriber_count() == 0 && !suites.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].status, SuiteStatus::Running);
    }

    #[tokio::test]
    async fn test_read_frame_limits() {
        let data: &[u8] = b"short\n0123456789abcdef\nnext\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert!(matches!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::Line));
        assert_eq!(buf, b"short\n");
        assert!(matches!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::TooLong));
        assert!(matches!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::Line));
        assert_eq!(buf, b"next\n");
        assert!(matches!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::Eof));
    }
}
