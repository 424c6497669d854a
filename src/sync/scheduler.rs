//! Coalescing scheduler — debounced, batched writes keyed by id.
//!
//! DESIGN
//! ======
//! Each key holds only its latest value and a deadline one quiet period
//! after its last change; scheduling the same key again overwrites the value
//! and resets the deadline. Nothing is flushed while every deadline lies in
//! the future. Once the earliest deadline passes, every entry due within the
//! coalesce slack goes out together so near-simultaneous edits share one
//! batch.
//!
//! The scheduler owns no timer. Callers pass `now` to every method and wake
//! themselves at `next_deadline()`, which keeps the behavior deterministic
//! under test.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One buffered write.
#[derive(Debug, Clone, PartialEq)]
struct Entry<V> {
    value: V,
    deadline: Instant,
    attempts: u32,
}

/// A write released by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Due<K, V> {
    pub key: K,
    pub value: V,
    /// Failed flushes this value has already been through.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CoalescingScheduler<K, V> {
    quiet_period: Duration,
    coalesce_slack: Duration,
    entries: BTreeMap<K, Entry<V>>,
}

impl<K: Ord + Clone, V> CoalescingScheduler<K, V> {
    #[must_use]
    pub fn new(quiet_period: Duration, coalesce_slack: Duration) -> Self {
        Self { quiet_period, coalesce_slack, entries: BTreeMap::new() }
    }

    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Buffer `value` for `key`, replacing any older value and restarting
    /// the key's quiet period.
    pub fn schedule(&mut self, key: K, value: V, now: Instant) {
        let deadline = now + self.quiet_period;
        self.entries.insert(key, Entry { value, deadline, attempts: 0 });
    }

    /// Put a failed write back in the buffer.
    ///
    /// A value buffered since the failed flush is newer and wins; only the
    /// attempt count carries over to it. Returns whether the failed value
    /// itself was re-queued.
    pub fn requeue(&mut self, key: K, value: V, attempts: u32, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.attempts = entry.attempts.max(attempts);
            return false;
        }
        let deadline = now + self.quiet_period;
        self.entries.insert(key, Entry { value, deadline, attempts });
        true
    }

    /// Drop the buffered write for `key`, returning its value.
    pub fn cancel(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove and return one entry regardless of its deadline.
    pub fn take(&mut self, key: &K) -> Option<Due<K, V>> {
        let (key, entry) = self.entries.remove_entry(key)?;
        Some(Due { key, value: entry.value, attempts: entry.attempts })
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline across all buffered keys.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Release the due group: empty until the earliest deadline has passed,
    /// then every entry whose deadline falls within the coalesce slack of
    /// `now`, in key order.
    pub fn take_due(&mut self, now: Instant) -> Vec<Due<K, V>> {
        match self.next_deadline() {
            Some(earliest) if earliest <= now => {}
            _ => return Vec::new(),
        }
        let cutoff = now + self.coalesce_slack;
        let due: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        due.iter().filter_map(|k| self.take(k)).collect()
    }

    /// Release everything, due or not.
    pub fn take_all(&mut self) -> Vec<Due<K, V>> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(key, e)| Due { key, value: e.value, attempts: e.attempts })
            .collect()
    }

    /// Pass the due group to `flush` when there is one. Returns how many
    /// entries were flushed.
    pub fn flush_due<F>(&mut self, now: Instant, flush: F) -> usize
    where
        F: FnOnce(Vec<Due<K, V>>),
    {
        let due = self.take_due(now);
        let count = due.len();
        if count > 0 {
            flush(due);
        }
        count
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;
