use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::get_current_time_ms;

/// Time source seam so retry timing is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        get_current_time_ms()
    }
}

/// Settable clock for tests and deterministic hosts.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledRetry {
    due_at_ms: u64,
    seq: u64,
}

/// Min-heap of retry due times. The engine schedules one entry per retriable
/// failure; the host polls `take_due` (or sleeps until `next_due`) and
/// triggers a sync pass when anything comes back.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<ScheduledRetry>>,
    next_seq: u64,
}

impl RetryScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due_at_ms: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledRetry { due_at_ms, seq }));
    }

    /// Pop every entry due at or before `now_ms`, earliest first.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due_at_ms > now_ms {
                break;
            }
            due.push(entry.due_at_ms);
            self.heap.pop();
        }
        due
    }

    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.due_at_ms)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn take_due_returns_earliest_first() {
        let mut scheduler = RetryScheduler::new();
        scheduler.schedule(3_000);
        scheduler.schedule(1_000);
        scheduler.schedule(2_000);

        assert_eq!(scheduler.next_due(), Some(1_000));
        assert_eq!(scheduler.take_due(500), Vec::<u64>::new());
        assert_eq!(scheduler.take_due(2_500), vec![1_000, 2_000]);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.take_due(3_000), vec![3_000]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn duplicate_due_times_all_fire() {
        let mut scheduler = RetryScheduler::new();
        scheduler.schedule(1_000);
        scheduler.schedule(1_000);
        assert_eq!(scheduler.take_due(1_000).len(), 2);
    }

    #[test]
    fn clear_cancels_everything() {
        let mut scheduler = RetryScheduler::new();
        scheduler.schedule(1_000);
        scheduler.clear();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_due(), None);
    }
}
