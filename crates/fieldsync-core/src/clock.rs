//! Logical timestamps for last-writer-wins merges.
//!
//! A [`Timestamp`] is `(time, writer)` compared lexicographically. Each writer
//! owns a [`Clock`] that never issues the same timestamp twice and always
//! issues something newer than every timestamp it has accepted from others.

use crate::writer_id::WriterId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds plus the writer that produced them.
///
/// Field order matters: the derived `Ord` compares `time` first and falls back
/// to `writer` so two writers hitting the same millisecond still have a total
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub time: u64,
    pub writer: WriterId,
}

impl Timestamp {
    /// Older than anything a clock can issue.
    pub const ZERO: Timestamp = Timestamp {
        time: 0,
        writer: WriterId::LEGACY,
    };

    pub fn new(time: u64, writer: WriterId) -> Self {
        Self { time, writer }
    }

    /// A timestamp read from data written before writers were recorded.
    pub fn legacy(time: u64) -> Self {
        Self {
            time,
            writer: WriterId::LEGACY,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.time, self.writer)
    }
}

/// Source of wall-clock milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock. Uses `web_time` so the same code reads `Date.now()` in the browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Per-writer monotonic clock.
pub struct Clock {
    writer: WriterId,
    last: Timestamp,
    source: Arc<dyn TimeSource>,
}

impl Clock {
    pub fn new(writer: WriterId, source: Arc<dyn TimeSource>) -> Self {
        Self {
            writer,
            last: Timestamp::ZERO,
            source,
        }
    }

    pub fn writer(&self) -> WriterId {
        self.writer
    }

    /// Wall-clock milliseconds from the underlying source.
    pub fn now_ms(&self) -> u64 {
        self.source.now_ms()
    }

    /// The most recent timestamp issued or observed.
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Issue a new timestamp: `max(now, last.time + 1)`.
    pub fn tick(&mut self) -> Timestamp {
        let now = self.source.now_ms();
        let time = now.max(self.last.time.saturating_add(1));
        self.last = Timestamp::new(time, self.writer);
        self.last
    }

    /// Record a timestamp accepted from another writer so later ticks sort after it.
    pub fn observe(&mut self, remote: Timestamp) {
        if remote > self.last {
            self.last = remote;
        }
    }
}
