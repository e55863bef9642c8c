//! TimerManager - one timerfd per reactor
//!
//! Deadlines live in an ordered set; the timerfd is always armed for the
//! earliest one, so timer expiry arrives as an ordinary readiness event.
//!
//! Firing is split in two so a task can be run with `&mut Reactor` while the
//! manager itself sits inside the reactor:
//!
//! ```ignore
//! for id in timers.pop_due(now) {
//!     if let Some(mut task) = timers.take_task(id) {
//!         run(&mut task);
//!         timers.restore_task(id, task);
//!     }
//! }
//! timers.rearm(now);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::sys;

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry<T> {
    deadline: Instant,
    period: Option<Duration>,
    task: Option<T>,
}

pub struct TimerManager<T> {
    fd: OwnedFd,
    queue: BTreeSet<(Instant, TimerId)>,
    entries: HashMap<TimerId, Entry<T>>,
    next_id: u64,
    armed_for: Option<Instant>,
}

impl<T> TimerManager<T> {
    pub fn new() -> Result<Self, Errno> {
        Ok(Self {
            fd: sys::timerfd()?,
            queue: BTreeSet::new(),
            entries: HashMap::new(),
            next_id: 1,
            armed_for: None,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Scheduled timers (one-shot timers count until they fire).
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire once after `delay`.
    pub fn schedule_once(&mut self, now: Instant, delay: Duration, task: T) -> TimerId {
        self.insert(now + delay, None, task, now)
    }

    /// Fire every `interval`, first after one interval.
    pub fn schedule_repeating(&mut self, now: Instant, interval: Duration, task: T) -> TimerId {
        let interval = interval.max(Duration::from_millis(1));
        self.insert(now + interval, Some(interval), task, now)
    }

    fn insert(&mut self, deadline: Instant, period: Option<Duration>, task: T, now: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                deadline,
                period,
                task: Some(task),
            },
        );
        self.queue.insert((deadline, id));
        self.rearm(now);
        id
    }

    /// Cancel a timer. Safe from inside its own task.
    pub fn cancel(&mut self, id: TimerId, now: Instant) -> bool {
        match self.entries.remove(&id) {
            Some(e) => {
                self.queue.remove(&(e.deadline, id));
                self.rearm(now);
                true
            }
            None => false,
        }
    }

    /// Timers due at `now`, in deadline order. Repeating timers are already
    /// queued for their next period when this returns.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(&(deadline, id)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.remove(&(deadline, id));
            due.push(id);
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(period) = entry.period {
                    let mut next = deadline + period;
                    if next <= now {
                        // Skip missed periods instead of firing a burst.
                        next = now + period;
                    }
                    entry.deadline = next;
                    self.queue.insert((next, id));
                }
            }
        }
        self.armed_for = None;
        due
    }

    /// Take a due timer's task to run it. One-shot timers are forgotten.
    pub fn take_task(&mut self, id: TimerId) -> Option<T> {
        let entry = self.entries.get_mut(&id)?;
        if entry.period.is_some() {
            entry.task.take()
        } else {
            self.entries.remove(&id).and_then(|e| e.task)
        }
    }

    /// Give a repeating timer its task back. Dropped if the timer was
    /// cancelled while running.
    pub fn restore_task(&mut self, id: TimerId, task: T) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.task.is_none() {
                entry.task = Some(task);
            }
        }
    }

    /// Point the timerfd at the earliest deadline, or disarm it.
    pub fn rearm(&mut self, now: Instant) {
        let next = self.queue.first().map(|&(d, _)| d);
        if next == self.armed_for {
            return;
        }
        let delay = next.map(|d| d.saturating_duration_since(now));
        match sys::timerfd_arm(&self.fd, delay) {
            Ok(()) => self.armed_for = next,
            Err(errno) => tracing::error!(%errno, "timerfd_settime failed"),
        }
    }

    /// Consume the expiration count after a readiness event.
    pub fn acknowledge(&self) {
        sys::drain_counter(self.fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_order_and_one_shot_removal() {
        let mut t: TimerManager<&str> = TimerManager::new().unwrap();
        let now = Instant::now();
        let b = t.schedule_once(now, Duration::from_millis(20), "b");
        let a = t.schedule_once(now, Duration::from_millis(10), "a");
        t.schedule_once(now, Duration::from_secs(60), "later");

        let due = t.pop_due(now + Duration::from_millis(25));
        assert_eq!(due, vec![a, b]);
        assert_eq!(t.take_task(a), Some("a"));
        assert_eq!(t.take_task(b), Some("b"));
        assert_eq!(t.take_task(a), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_repeating_requeues() {
        let mut t: TimerManager<u32> = TimerManager::new().unwrap();
        let now = Instant::now();
        let id = t.schedule_repeating(now, Duration::from_millis(10), 7);

        let due = t.pop_due(now + Duration::from_millis(10));
        assert_eq!(due, vec![id]);
        let task = t.take_task(id).unwrap();
        t.restore_task(id, task);

        assert!(t.pop_due(now + Duration::from_millis(15)).is_empty());
        assert_eq!(t.pop_due(now + Duration::from_millis(20)), vec![id]);
    }

    #[test]
    fn test_missed_periods_do_not_burst() {
        let mut t: TimerManager<()> = TimerManager::new().unwrap();
        let now = Instant::now();
        let id = t.schedule_repeating(now, Duration::from_millis(10), ());
        assert_eq!(t.pop_due(now + Duration::from_millis(100)), vec![id]);
        assert!(t.pop_due(now + Duration::from_millis(105)).is_empty());
    }

    #[test]
    fn test_cancel_while_running_drops_task() {
        let mut t: TimerManager<String> = TimerManager::new().unwrap();
        let now = Instant::now();
        let id = t.schedule_repeating(now, Duration::from_millis(5), "tick".to_string());
        t.pop_due(now + Duration::from_millis(5));
        let task = t.take_task(id).unwrap();
        assert!(t.cancel(id, now));
        t.restore_task(id, task);
        assert!(t.is_empty());
        assert!(!t.cancel(id, now));
    }

    #[test]
    fn test_timerfd_fires() {
        let mut t: TimerManager<()> = TimerManager::new().unwrap();
        let now = Instant::now();
        t.schedule_once(now, Duration::from_millis(1), ());
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(t.fd(), buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, 8);
        assert!(u64::from_ne_bytes(buf) >= 1);
    }
}
