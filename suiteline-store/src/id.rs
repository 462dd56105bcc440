//! Document id generation.
//!
//! An id is the lowercase hex concatenation of
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┐
//! │ unix seconds │ counter      │ random       │
//! │ 8 hex (u32)  │ 8 hex (u32)  │ 6 hex (3 B)  │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Fixed widths keep ids roughly chronological under byte order. The
//! counter belongs to the generator instance, so independent stores never
//! share state.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

/// Length of every generated id.
pub const ID_LEN: usize = 22;

#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter at `seed` (useful to make tests deterministic).
    pub fn with_seed(seed: u32) -> Self {
        Self {
            counter: AtomicU32::new(seed),
        }
    }

    pub fn next_id(&self) -> String {
        self.next_id_at(Utc::now())
    }

    pub fn next_id_at(&self, now: DateTime<Utc>) -> String {
        let secs = now.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let [a, b, c] = rand::random::<[u8; 3]>();
        format!("{secs:08x}{count:08x}{a:02x}{b:02x}{c:02x}")
    }
}
