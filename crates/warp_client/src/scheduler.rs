//! Cancelable timers driven by an explicit clock.
//!
//! The link layer never sleeps. Reconnect backoff, idle watch and delayed
//! unlink are entries in a [`Scheduler`]; whoever owns the
//! [`DownlinkContext`](crate::DownlinkContext) advances the clock and the due
//! entries fire in deadline order. Tests move time by hand; the async client
//! sleeps until [`Scheduler::next_deadline`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use url::Url;

use crate::downlink::LinkKey;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Reopen a host connection after backoff.
    Reconnect { host: Url },
    /// Close a host connection if it is still idle.
    Idle { host: Url },
    /// Unlink a downlink whose last view detached.
    Unlink { host: Url, link: LinkKey },
}

impl TimerEvent {
    /// The host the timer belongs to.
    pub fn host(&self) -> &Url {
        match self {
            TimerEvent::Reconnect { host }
            | TimerEvent::Idle { host }
            | TimerEvent::Unlink { host, .. } => host,
        }
    }
}

/// Deadline-ordered set of pending timers.
#[derive(Debug)]
pub struct Scheduler {
    now: Instant,
    next_id: u64,
    queue: BTreeMap<(Instant, TimerId), TimerEvent>,
    deadlines: HashMap<TimerId, Instant>,
}

impl Scheduler {
    /// Create an empty scheduler whose clock reads `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// The scheduler's current time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Schedule `event` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = self.now + delay;
        self.queue.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer. Returns `false` if it already fired or was canceled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Whether a timer is still pending.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop the earliest timer due at or before `until`, moving the clock to
    /// its deadline. Returns `None` (and moves the clock to `until`) when
    /// nothing else is due.
    pub(crate) fn pop_due(&mut self, until: Instant) -> Option<(TimerId, TimerEvent)> {
        let due = match self.queue.first_key_value() {
            Some((&(deadline, id), _)) if deadline <= until => Some((deadline, id)),
            _ => None,
        };
        match due {
            Some((deadline, id)) => {
                let event = self.queue.remove(&(deadline, id))?;
                self.deadlines.remove(&id);
                self.now = self.now.max(deadline);
                Some((id, event))
            }
            None => {
                self.now = self.now.max(until);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Url {
        Url::parse("warp://example.com").unwrap()
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(t0);
        scheduler.schedule(Duration::from_millis(30), TimerEvent::Idle { host: host() });
        scheduler.schedule(Duration::from_millis(10), TimerEvent::Reconnect { host: host() });

        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_millis(10)));

        let until = t0 + Duration::from_millis(50);
        let (_, first) = scheduler.pop_due(until).unwrap();
        assert_eq!(first, TimerEvent::Reconnect { host: host() });
        assert_eq!(scheduler.now(), t0 + Duration::from_millis(10));

        let (_, second) = scheduler.pop_due(until).unwrap();
        assert_eq!(second, TimerEvent::Idle { host: host() });

        assert!(scheduler.pop_due(until).is_none());
        assert_eq!(scheduler.now(), until);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(t0);
        scheduler.schedule(Duration::from_millis(50), TimerEvent::Idle { host: host() });

        assert!(scheduler.pop_due(t0 + Duration::from_millis(49)).is_none());
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.pop_due(t0 + Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_cancel() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(t0);
        let id = scheduler.schedule(Duration::from_millis(5), TimerEvent::Idle { host: host() });

        assert!(scheduler.is_pending(id));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.is_pending(id));
        assert!(!scheduler.cancel(id));
        assert!(scheduler.pop_due(t0 + Duration::from_secs(1)).is_none());
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_schedule_relative_to_advanced_clock() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(t0);
        assert!(scheduler.pop_due(t0 + Duration::from_millis(100)).is_none());

        scheduler.schedule(Duration::from_millis(10), TimerEvent::Idle { host: host() });
        assert_eq!(
            scheduler.next_deadline(),
            Some(t0 + Duration::from_millis(110))
        );
    }
}
