//! Synchronous, unbuffered change fan-out.
//!
//! Every store mutation publishes one [`Change`] while the store's write
//! lock is held. Each subscriber owns a zero-capacity (rendezvous) channel:
//!
//! ```text
//! DocumentStore::update ─► ChangeBus::publish ─┬─► sub 1 (blocks until recv)
//!        (write lock held)                     ├─► sub 2
//!                                              └─► sub N
//! ```
//!
//! # Liveness hazard
//!
//! There is no buffering. A subscriber that stops reading blocks `publish`,
//! which blocks the writer holding the store lock, which blocks every other
//! writer. Subscribers must drain their channel promptly (on a dedicated
//! thread if the consumer is slow) and must never write to the store from
//! the thread that receives changes. Dropping the [`Subscription`] releases
//! a blocked publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{ChangedFields, Collection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
}

/// One store mutation, as seen by watchers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub operation: Operation,
    pub collection: Collection,
    pub doc_id: String,
    /// Fields touched by an update; `None` for inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<ChangedFields>,
    /// Full record after the mutation.
    pub payload: Value,
}

impl Change {
    pub fn insert(collection: Collection, doc_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: Operation::Insert,
            collection,
            doc_id: doc_id.into(),
            changed_fields: None,
            payload,
        }
    }

    pub fn update(
        collection: Collection,
        doc_id: impl Into<String>,
        changed_fields: ChangedFields,
        payload: Value,
    ) -> Self {
        Self {
            operation: Operation::Update,
            collection,
            doc_id: doc_id.into(),
            changed_fields: Some(changed_fields),
            payload,
        }
    }
}

struct Subscriber {
    id: u64,
    events: Sender<Change>,
    done: Receiver<()>,
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    events: Receiver<Change>,
    _done: Sender<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the next change. Errors once the bus is gone.
    pub fn recv(&self) -> Result<Change, RecvError> {
        self.events.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Change, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Change, TryRecvError> {
        self.events.try_recv()
    }

    /// Raw channel, for use in a caller's own `select!`.
    pub fn receiver(&self) -> &Receiver<Change> {
        &self.events
    }

    /// Explicit form of dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// In-process broadcaster feeding every subscriber synchronously.
#[derive(Default)]
pub struct ChangeBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (events_tx, events_rx) = channel::bounded(0);
        let (done_tx, done_rx) = channel::bounded(0);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                events: events_tx,
                done: done_rx,
            });
        log::debug!("change bus: subscriber {id} added");

        Subscription {
            id,
            events: events_rx,
            _done: done_tx,
        }
    }

    /// Hand `change` to every subscriber in turn.
    ///
    /// Blocks until each subscriber has either received the change or
    /// unsubscribed. Unsubscribed entries are dropped, which closes their
    /// channel. Returns the number of deliveries.
    pub fn publish(&self, change: &Change) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|sub| {
            let kept = crossbeam::select! {
                send(sub.events, change.clone()) -> res => res.is_ok(),
                recv(sub.done) -> _ => false,
            };
            if kept {
                delivered += 1;
            } else {
                log::debug!("change bus: subscriber {} removed", sub.id);
            }
            kept
        });

        self.published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total changes published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
