//! One-shot and repeating timers, ordered by a min-heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback run when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A one-shot or repeating timer.
///
/// Cancellation is a flag: a cancelled timer stays in the heap until its
/// deadline and is then skipped silently.
pub struct Timer {
    deadline: Instant,
    interval: Option<Duration>,
    cancelled: AtomicBool,
    callback: TimerCallback,
}

impl Timer {
    /// Fire once, `delay` from now.
    pub fn once(delay: Duration, callback: TimerCallback) -> Arc<Self> {
        Arc::new(Timer {
            deadline: Instant::now() + delay,
            interval: None,
            cancelled: AtomicBool::new(false),
            callback,
        })
    }

    /// Fire every `interval`, first firing one interval from now.
    pub fn repeating(interval: Duration, callback: TimerCallback) -> Arc<Self> {
        Arc::new(Timer {
            deadline: Instant::now() + interval,
            interval: Some(interval),
            cancelled: AtomicBool::new(false),
            callback,
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn run(&self) {
        (self.callback)();
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    timer: Arc<Timer>,
}

// BinaryHeap is a max-heap; reverse so the earliest deadline surfaces.
// Ties break by insertion sequence, keeping fire order stable.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Min-heap of timers keyed by next-fire deadline.
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn add(&mut self, timer: Arc<Timer>) {
        let deadline = timer.deadline;
        self.push(deadline, timer);
    }

    fn push(&mut self, deadline: Instant, timer: Arc<Timer>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            timer,
        });
    }

    /// Cancel a queued timer. The entry stays in the heap until due and is
    /// then dropped without running.
    pub fn cancel(&mut self, timer: &Arc<Timer>) {
        timer.cancel();
    }

    /// Deadline of the earliest pending timer, if any.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop every timer due at `now`, in non-decreasing deadline order.
    ///
    /// Repeating timers are re-armed at `fired_deadline + interval`, not
    /// `now + interval`, so their schedule does not drift under load.
    /// Cancelled timers are dropped silently.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Arc<Timer>> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(e) => e,
                None => break,
            };
            if entry.timer.is_cancelled() {
                continue;
            }
            if let Some(interval) = entry.timer.interval {
                self.push(entry.deadline + interval, entry.timer.clone());
            }
            due.push(entry.timer);
        }
        due
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    fn timer_at(deadline: Instant, interval: Option<Duration>) -> Arc<Timer> {
        Arc::new(Timer {
            deadline,
            interval,
            cancelled: AtomicBool::new(false),
            callback: noop(),
        })
    }

    #[test]
    fn fires_in_deadline_order() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let late = timer_at(base + Duration::from_millis(20), None);
        let early = timer_at(base + Duration::from_millis(5), None);
        heap.add(late.clone());
        heap.add(early.clone());

        let due = heap.fire_due(base + Duration::from_millis(30));
        assert_eq!(due.len(), 2);
        assert!(Arc::ptr_eq(&due[0], &early));
        assert!(Arc::ptr_eq(&due[1], &late));
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let base = Instant::now();
        let deadline = base + Duration::from_millis(5);
        let mut heap = TimerHeap::new();
        let first = timer_at(deadline, None);
        let second = timer_at(deadline, None);
        heap.add(first.clone());
        heap.add(second.clone());

        let due = heap.fire_due(deadline);
        assert!(Arc::ptr_eq(&due[0], &first));
        assert!(Arc::ptr_eq(&due[1], &second));
    }

    #[test]
    fn not_due_timers_stay() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.add(timer_at(base + Duration::from_secs(60), None));
        assert!(heap.fire_due(base).is_empty());
        assert!(!heap.is_empty());
    }

    #[test]
    fn cancelled_timers_are_skipped() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        let t = timer_at(base, Some(Duration::from_millis(1)));
        heap.add(t.clone());
        t.cancel();
        assert!(heap.fire_due(base + Duration::from_secs(1)).is_empty());
        // a cancelled repeating timer is not re-armed
        assert!(heap.is_empty());
    }

    #[test]
    fn repeating_rearms_from_fired_deadline() {
        let base = Instant::now();
        let interval = Duration::from_millis(10);
        let mut heap = TimerHeap::new();
        heap.add(timer_at(base, Some(interval)));

        // fire late: re-arm must be base + interval, not late_now + interval
        let late_now = base + Duration::from_millis(7);
        assert_eq!(heap.fire_due(late_now).len(), 1);
        assert_eq!(heap.earliest_deadline(), Some(base + interval));

        // after N firings the Nth deadline is base + N * interval
        let mut fired = 1;
        while fired < 5 {
            fired += heap.fire_due(base + interval * fired).len() as u32;
        }
        assert_eq!(heap.earliest_deadline(), Some(base + interval * 5));
    }
}
