//! Debounced replication scheduler.
//!
//! Holds at most one pending write per key. Scheduling again replaces the
//! payload and restarts the window. The scheduler never reads a clock: the
//! caller passes `now_ms` to every call, so it is a plain state machine that
//! tests can drive deterministically.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
struct Pending<P> {
    payload: P,
    due_at: u64,
}

/// One pending payload per key, released once its window has elapsed.
#[derive(Debug, Clone)]
pub struct DebounceScheduler<K: Ord + Copy, P> {
    pending: BTreeMap<K, Pending<P>>,
}

impl<K: Ord + Copy, P> Default for DebounceScheduler<K, P> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Copy, P> DebounceScheduler<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` for `key`, replacing any pending payload and
    /// restarting its window.
    ///
    /// Returns the payload that was superseded, if any.
    pub fn schedule(&mut self, key: K, payload: P, now_ms: u64, window_ms: u64) -> Option<P> {
        self.pending
            .insert(
                key,
                Pending {
                    payload,
                    due_at: now_ms.saturating_add(window_ms),
                },
            )
            .map(|p| p.payload)
    }

    /// Remove and return every entry whose window has elapsed, in key order.
    pub fn due(&mut self, now_ms: u64) -> Vec<(K, P)> {
        let ready: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due_at <= now_ms)
            .map(|(k, _)| *k)
            .collect();

        ready
            .into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.payload)))
            .collect()
    }

    /// Take the pending payload for `key` regardless of its window.
    pub fn force_flush(&mut self, key: K) -> Option<P> {
        self.pending.remove(&key).map(|p| p.payload)
    }

    /// Take every pending payload regardless of window, in key order.
    pub fn drain(&mut self) -> Vec<(K, P)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(k, p)| (k, p.payload))
            .collect()
    }

    /// Drop every pending payload without sending it.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn is_pending(&self, key: K) -> bool {
        self.pending.contains_key(&key)
    }

    /// Earliest time anything becomes due.
    pub fn next_due(&self) -> Option<u64> {
        self.pending.values().map(|p| p.due_at).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_due_before_window() {
        let mut scheduler = DebounceScheduler::new();
        scheduler.schedule("images", 1, 1000, 1000);
        assert!(scheduler.due(1999).is_empty());
        assert_eq!(scheduler.due(2000), vec![("images", 1)]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_burst_coalesces_to_latest_payload() {
        let mut scheduler = DebounceScheduler::new();
        for (i, now) in [0u64, 500, 900, 1400].into_iter().enumerate() {
            scheduler.schedule("meta", i, now, 3000);
        }
        // Window restarted at 1400.
        assert!(scheduler.due(4399).is_empty());
        assert_eq!(scheduler.due(4400), vec![("meta", 3)]);
    }

    #[test]
    fn test_schedule_returns_superseded() {
        let mut scheduler = DebounceScheduler::new();
        assert_eq!(scheduler.schedule(1, "a", 0, 10), None);
        assert_eq!(scheduler.schedule(1, "b", 5, 10), Some("a"));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut scheduler = DebounceScheduler::new();
        scheduler.schedule("structural", 'a', 0, 1000);
        scheduler.schedule("snapshot", 'b', 0, 15000);
        assert_eq!(scheduler.next_due(), Some(1000));
        assert_eq!(scheduler.due(1000), vec![("structural", 'a')]);
        assert!(scheduler.is_pending("snapshot"));
    }

    #[test]
    fn test_force_flush_supersedes_timer() {
        let mut scheduler = DebounceScheduler::new();
        scheduler.schedule("images", 7, 0, 1000);
        assert_eq!(scheduler.force_flush("images"), Some(7));
        // The old timer firing later is a no-op.
        assert!(scheduler.due(5000).is_empty());
        assert_eq!(scheduler.force_flush("images"), None);
    }

    #[test]
    fn test_drain_and_cancel() {
        let mut scheduler = DebounceScheduler::new();
        scheduler.schedule(2, "b", 0, 1000);
        scheduler.schedule(1, "a", 0, 1000);
        assert_eq!(scheduler.drain(), vec![(1, "a"), (2, "b")]);

        scheduler.schedule(3, "c", 0, 1000);
        assert_eq!(scheduler.cancel_all(), 1);
        assert!(scheduler.due(u64::MAX).is_empty());
    }
}
