//! Simulation and wall clocks
//!
//! Every core component that needs "now" takes a clock handle. Production
//! supplies [`SystemClock`]; tests supply a [`SimClock`] and drive it manually
//! for determinism.

use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Clock errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("time cannot move backwards (delta {0} ms)")]
    InvalidTime(i64),
}

/// Source of monotonic milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock with a strict monotonicity guard: never returns a value earlier
/// than a previous call, even across system clock adjustments.
#[derive(Default)]
pub struct SystemClock {
    last: Mutex<u64>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut last = self.last.lock();
        if wall > *last {
            *last = wall;
        }
        *last
    }
}

type Task = Box<dyn FnOnce() + Send>;

struct Scheduled {
    when: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest deadline first; seq keeps
    // same-tick tasks FIFO.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

struct SimState {
    now: u64,
    seq: u64,
    speed: f64,
    queue: BinaryHeap<Scheduled>,
}

/// Monotonic simulation clock measured in milliseconds.
///
/// `advance` fires scheduled tasks in order of scheduled time, FIFO within a
/// tick. Tasks may schedule further tasks; anything landing within the advance
/// window fires during the same call.
pub struct SimClock {
    state: Mutex<SimState>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(now: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                now,
                seq: 0,
                speed: 1.0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    /// Advance simulated time by a non-negative delta, firing due tasks.
    pub fn advance(&self, delta_ms: i64) -> Result<(), ClockError> {
        if delta_ms < 0 {
            return Err(ClockError::InvalidTime(delta_ms));
        }
        let target = self.state.lock().now + delta_ms as u64;
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.queue.peek() {
                    Some(top) if top.when <= target => {
                        let entry = state.queue.pop().expect("peeked entry");
                        state.now = state.now.max(entry.when);
                        entry.task
                    }
                    _ => break,
                }
            };
            // Run outside the lock: tasks are allowed to schedule more work.
            task();
        }
        self.state.lock().now = target;
        Ok(())
    }

    /// Register a task at an absolute time; past deadlines fire on the next
    /// advance.
    pub fn schedule_at(&self, when: u64, task: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        let when = when.max(state.now);
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Scheduled {
            when,
            seq,
            task: Box::new(task),
        });
    }

    /// Register a task `delta_ms` from now.
    pub fn schedule_after(&self, delta_ms: u64, task: impl FnOnce() + Send + 'static) {
        let when = self.state.lock().now + delta_ms;
        self.schedule_at(when, task);
    }

    /// Real-time binding hint for an external driver; no semantic effect on
    /// simulated time.
    pub fn set_speed(&self, multiplier: f64) {
        self.state.lock().speed = multiplier;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.state.lock().now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_advance_moves_time() {
        let clock = SimClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(250).unwrap();
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn test_negative_delta_rejected() {
        let clock = SimClock::new();
        assert_eq!(clock.advance(-1), Err(ClockError::InvalidTime(-1)));
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_tasks_fire_in_deadline_order_fifo_within_tick() {
        let clock = SimClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, when) in [("b", 20u64), ("a", 10), ("c", 20), ("d", 5)] {
            let fired = fired.clone();
            clock.schedule_at(when, move || fired.lock().push(label));
        }
        clock.advance(20).unwrap();
        assert_eq!(*fired.lock(), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_task_scheduled_during_advance_fires_in_window() {
        let clock = Arc::new(SimClock::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_clock = clock.clone();
        let inner_count = count.clone();
        clock.schedule_at(10, move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let count = inner_count.clone();
            inner_clock.schedule_after(5, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        });

        clock.advance(100).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn test_future_task_does_not_fire() {
        let clock = SimClock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        clock.schedule_at(1000, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        clock.advance(999).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_tasks(), 1);
        clock.advance(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_speed_is_a_driver_hint_only() {
        let clock = SimClock::new();
        clock.set_speed(10.0);
        assert_eq!(clock.speed(), 10.0);
        clock.advance(100).unwrap();
        assert_eq!(clock.now_ms(), 100);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
