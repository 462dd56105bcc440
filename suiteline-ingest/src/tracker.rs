//! Detachment and reconnection of suites whose runner dropped off.
//!
//! A suite whose connection ends before `set_suite_status` is *detached*:
//! its status becomes `disconnected` and `disconnected_at` is stamped. A
//! later `reconnect` may resume it while the detachment window is open.
//!
//! Two ways to judge the window:
//! - [`Detachment::Persisted`]: `now - disconnected_at <= ttl`, read from the
//!   suite document. Survives a server restart.
//! - [`Detachment::Memory`]: a deadline kept in a [`DetachmentTracker`],
//!   purged periodically by [`DetachmentTracker::spawn_sweeper`]. Deadlines
//!   are lost on restart, so every suite detached before it is expired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use suiteline_store::{DocumentStore, StoreError, Suite, SuitePatch, SuiteStatus};

/// Why a suite could not be resumed.
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("not found")]
    NotFound,
    #[error("not disconnected")]
    NotReconnectable,
    #[error("expired")]
    Expired,
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReconnectError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            ReconnectError::NotFound
        } else if err.is_conflict() {
            ReconnectError::NotReconnectable
        } else {
            ReconnectError::Store(err)
        }
    }
}

/// Convert a std duration to a chrono one, saturating.
fn window(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// Mark a running suite `disconnected` at `now`.
pub fn detach_suite(
    store: &DocumentStore,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Suite, StoreError> {
    let patch = SuitePatch::default()
        .status(SuiteStatus::Disconnected)
        .disconnected_at(Some(now));
    store.update::<Suite>(id, &patch)
}

/// Resume a detached suite if `disconnected_at` is within `ttl` of `now`.
pub fn reconnect_suite(
    store: &DocumentStore,
    id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<Suite, ReconnectError> {
    let suite: Suite = store.find(id)?;
    if suite.meta.deleted || suite.status != SuiteStatus::Disconnected {
        return Err(ReconnectError::NotReconnectable);
    }
    match suite.disconnected_at {
        Some(at) if now - at <= window(ttl) => {}
        _ => return Err(ReconnectError::Expired),
    }
    resume(store, id)
}

/// Flip a detached suite back to `running`.
///
/// The status check is repeated under the store write lock, so of several
/// concurrent reconnects only one wins.
fn resume(store: &DocumentStore, id: &str) -> Result<Suite, ReconnectError> {
    let patch = SuitePatch::default()
        .status(SuiteStatus::Running)
        .disconnected_at(None)
        .require_status(SuiteStatus::Disconnected);
    Ok(store.update::<Suite>(id, &patch)?)
}

// ─── In-memory tracker ────────────────────────────────────────────

/// Suite id → reconnect deadline.
#[derive(Debug, Default)]
pub struct DetachmentTracker {
    deadlines: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DetachmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detach_at(&self, id: &str, now: DateTime<Utc>, ttl: Duration) {
        let deadline = now.checked_add_signed(window(ttl)).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.lock().insert(id.to_string(), deadline);
    }

    /// Take the entry for `id` if its deadline has not passed.
    ///
    /// An expired entry is removed as well.
    pub fn reattach_at(&self, id: &str, now: DateTime<Utc>) -> Result<(), ReconnectError> {
        match self.lock().remove(id) {
            Some(deadline) if now <= deadline => Ok(()),
            _ => Err(ReconnectError::Expired),
        }
    }

    /// Drop every entry whose deadline is before `now`. Returns how many.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut deadlines = self.lock();
        let before = deadlines.len();
        deadlines.retain(|_, deadline| *deadline >= now);
        before - deadlines.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Run [`sweep`](Self::sweep) every `period` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.sweep(Utc::now());
                        if purged > 0 {
                            log::debug!("Detachment sweep purged {purged} expired suites");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Strategy ─────────────────────────────────────────────────────

/// Which detachment window a server enforces.
#[derive(Debug, Clone, Default)]
pub enum Detachment {
    #[default]
    Persisted,
    Memory(Arc<DetachmentTracker>),
}

impl Detachment {
    pub fn memory() -> Self {
        Detachment::Memory(Arc::new(DetachmentTracker::new()))
    }

    pub fn tracker(&self) -> Option<&Arc<DetachmentTracker>> {
        match self {
            Detachment::Persisted => None,
            Detachment::Memory(tracker) => Some(tracker),
        }
    }

    /// Stamp the suite disconnected and, for the in-memory variant, open
    /// its window.
    pub fn detach(
        &self,
        store: &DocumentStore,
        id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Suite, StoreError> {
        let suite = detach_suite(store, id, now)?;
        if let Detachment::Memory(tracker) = self {
            tracker.detach_at(id, now, ttl);
        }
        Ok(suite)
    }

    pub fn reconnect(
        &self,
        store: &DocumentStore,
        id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Suite, ReconnectError> {
        match self {
            Detachment::Persisted => reconnect_suite(store, id, now, ttl),
            Detachment::Memory(tracker) => {
                let suite: Suite = store.find(id)?;
                if suite.meta.deleted || suite.status != SuiteStatus::Disconnected {
                    return Err(ReconnectError::NotReconnectable);
                }
                tracker.reattach_at(id, now)?;
                resume(store, id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use suiteline_store::StoreConfig;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn open_store() -> (TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_detach_stamps_suite() {
        let (_dir, store) = open_store();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        let suite = detach_suite(&store, &id, t(5)).unwrap();
        assert_eq!(suite.status, SuiteStatus::Disconnected);
        assert_eq!(suite.disconnected_at, Some(t(5)));
    }

    #[test]
    fn test_reconnect_within_window() {
        let (_dir, store) = open_store();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        detach_suite(&store, &id, t(10)).unwrap();

        let suite = reconnect_suite(&store, &id, t(70), TTL).unwrap();
        assert_eq!(suite.status, SuiteStatus::Running);
        assert!(suite.disconnected_at.is_none());
    }

    #[test]
    fn test_reconnect_after_window() {
        let (_dir, store) = open_store();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        detach_suite(&store, &id, t(10)).unwrap();

        let err = reconnect_suite(&store, &id, t(71), TTL).unwrap_err();
        assert!(matches!(err, ReconnectError::Expired));
        assert_eq!(err.to_string(), "expired");
        // Still disconnected
        let suite: Suite = store.find(&id).unwrap();
        assert_eq!(suite.status, SuiteStatus::Disconnected);
    }

    #[test]
    fn test_reconnect_running_suite() {
        let (_dir, store) = open_store();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        let err = reconnect_suite(&store, &id, t(1), TTL).unwrap_err();
        assert!(matches!(err, ReconnectError::NotReconnectable));
        assert_eq!(err.to_string(), "not disconnected");
    }

    #[test]
    fn test_concurrent_reconnects_have_one_winner() {
        let (_dir, store) = open_store();
        let store = Arc::new(store);
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        detach_suite(&store, &id, t(10)).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reconnect_suite(&store, &id, t(20), TTL)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err, ReconnectError::NotReconnectable));
        }
        // One status flip, one version bump past the detach
        let suite: Suite = store.find(&id).unwrap();
        assert_eq!(suite.status, SuiteStatus::Running);
        assert_eq!(suite.meta.version, 2);
    }

    #[test]
    fn test_resume_rechecks_status() {
        let (_dir, store) = open_store();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        let err = resume(&store, &id).unwrap_err();
        assert!(matches!(err, ReconnectError::NotReconnectable));
        assert_eq!(store.find::<Suite>(&id).unwrap().meta.version, 0);
    }

    #[test]
    fn test_reconnect_unknown_suite() {
        let (_dir, store) = open_store();
        let err = reconnect_suite(&store, "missing", t(1), TTL).unwrap_err();
        assert!(matches!(err, ReconnectError::NotFound));
    }

    #[test]
    fn test_tracker_deadlines() {
        let tracker = DetachmentTracker::new();
        tracker.detach_at("a", t(0), TTL);
        tracker.detach_at("b", t(30), TTL);
        assert_eq!(tracker.len(), 2);

        assert_eq!(tracker.sweep(t(61)), 1);
        assert!(!tracker.contains("a"));
        assert!(tracker.contains("b"));

        assert!(tracker.reattach_at("b", t(90)).is_ok());
        assert!(tracker.is_empty());
        assert!(matches!(
            tracker.reattach_at("b", t(90)),
            Err(ReconnectError::Expired)
        ));
    }

    #[test]
    fn test_memory_variant_round_trip() {
        let (_dir, store) = open_store();
        let detachment = Detachment::memory();
        let id = store.insert(Suite::new("s", t(0))).unwrap();

        detachment.detach(&store, &id, t(0), TTL).unwrap();
        assert!(detachment.tracker().unwrap().contains(&id));

        let suite = detachment.reconnect(&store, &id, t(30), TTL).unwrap();
        assert_eq!(suite.status, SuiteStatus::Running);
        assert!(detachment.tracker().unwrap().is_empty());
    }

    #[test]
    fn test_memory_variant_forgets_swept_suites() {
        let (_dir, store) = open_store();
        let detachment = Detachment::memory();
        let id = store.insert(Suite::new("s", t(0))).unwrap();
        detachment.detach(&store, &id, t(0), TTL).unwrap();

        detachment.tracker().unwrap().sweep(t(120));
        let err = detachment.reconnect(&store, &id, t(121), TTL).unwrap_err();
        assert!(matches!(err, ReconnectError::Expired));

        // The sweep never touches the stored suite
        let suite: Suite = store.find(&id).unwrap();
        assert_eq!(suite.status, SuiteStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let tracker = Arc::new(DetachmentTracker::new());
        tracker.detach_at("old", Utc::now() - chrono::Duration::hours(1), TTL);

        let (tx, rx) = watch::channel(false);
        let handle = tracker.clone().spawn_sweeper(Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tracker.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
