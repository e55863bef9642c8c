//! DeferredReclaimList - objects waiting to be dropped
//!
//! Connection objects are retired here instead of being dropped while the
//! reactor may still be inside a dispatch that touches them. Ownership moves
//! into the list; the list's drop glue performs the destruction later.
//!
//! `flush` does nothing until more than `threshold` objects are waiting, then
//! drops every entry at least `max_age` old from the front. Entries are
//! appended in time order, so the scan stops at the first young one and the
//! cost per retired object stays O(1).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct DeferredReclaimList<T> {
    entries: VecDeque<(Instant, T)>,
    threshold: usize,
    max_age: Duration,
}

impl<T> DeferredReclaimList<T> {
    pub fn new(threshold: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            threshold,
            max_age,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take ownership of `obj`; it is dropped by a later flush.
    #[inline]
    pub fn retire(&mut self, obj: T) {
        self.retire_at(obj, Instant::now());
    }

    pub fn retire_at(&mut self, obj: T, now: Instant) {
        self.entries.push_back((now, obj));
    }

    /// Reclaim aged entries once the list exceeds its threshold.
    /// Returns how many objects were dropped.
    #[inline]
    pub fn flush(&mut self) -> usize {
        self.flush_at(Instant::now())
    }

    pub fn flush_at(&mut self, now: Instant) -> usize {
        if self.entries.len() <= self.threshold {
            return 0;
        }
        let mut dropped = 0;
        while let Some((born, _)) = self.entries.front() {
            if now.saturating_duration_since(*born) < self.max_age {
                break;
            }
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Drop everything regardless of age.
    pub fn flush_all(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}

impl<T> Drop for DeferredReclaimList<T> {
    fn drop(&mut self) {
        self.flush_all();
    }
}
