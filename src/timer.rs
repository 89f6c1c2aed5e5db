//! Per-link timers.
//!
//! Every timer kind is a singleton: starting it again replaces the pending
//! one. Each start hands out a token carrying a generation number, so an
//! external scheduler firing an old token is simply ignored.
use std::time::{Duration, Instant};

/// Kinds of timeouts the link runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Discovery: spacing between our XID slots.
    Slot = 0,
    /// Discovery: how long to stay in REPLY.
    Query = 1,
    /// Primary: waiting for the secondary's final frame.
    Final = 2,
    /// Primary: how long we may hold the floor.
    Poll = 3,
    /// Secondary: how long without being polled.
    Watchdog = 4,
    /// Setup: random backoff between SNRM attempts.
    Backoff = 5,
    /// NDM: media was busy, try again later.
    MediaBusy = 6,
    /// Upper layer discovery period.
    Discovery = 7,
}

impl TimerKind {
    pub const VALUES: [Self; 8] = [
        TimerKind::Slot,
        TimerKind::Query,
        TimerKind::Final,
        TimerKind::Poll,
        TimerKind::Watchdog,
        TimerKind::Backoff,
        TimerKind::MediaBusy,
        TimerKind::Discovery,
    ];
}

/// Handle for one particular start of a timer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug, Copy, Clone)]
struct Armed {
    generation: u64,
    deadline: Instant,
    duration: Duration,
}

/// One slot per `TimerKind`.
#[derive(Debug, Default)]
pub struct TimerTable {
    slots: [Option<Armed>; 8],
    generation: u64,
}

impl TimerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a timer.
    pub fn start(&mut self, kind: TimerKind, duration: Duration) -> TimerToken {
        self.start_at(kind, duration, Instant::now())
    }

    pub(crate) fn start_at(&mut self, kind: TimerKind, duration: Duration, now: Instant) -> TimerToken {
        self.generation += 1;
        self.slots[kind as usize] = Some(Armed {
            generation: self.generation,
            deadline: now + duration,
            duration,
        });
        TimerToken {
            kind,
            generation: self.generation,
        }
    }

    pub fn stop(&mut self, kind: TimerKind) {
        self.slots[kind as usize] = None;
    }

    #[must_use]
    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.slots[kind as usize].is_some()
    }

    /// Duration the timer was last started with, if running.
    #[must_use]
    pub fn duration(&self, kind: TimerKind) -> Option<Duration> {
        self.slots[kind as usize].map(|a| a.duration)
    }

    /// Current token of a running timer.
    #[must_use]
    pub fn token(&self, kind: TimerKind) -> Option<TimerToken> {
        self.slots[kind as usize].map(|a| TimerToken {
            kind,
            generation: a.generation,
        })
    }

    /// Consume a token. True if it was still the live one.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.slots[token.kind as usize] {
            Some(a) if a.generation == token.generation => {
                self.slots[token.kind as usize] = None;
                true
            }
            _ => false,
        }
    }

    /// Tokens of all timers due at `now`, earliest first. Nothing is
    /// disarmed; `fire` each in turn, since handling one may restart or stop
    /// another.
    #[must_use]
    pub fn due(&self, now: Instant) -> Vec<TimerToken> {
        let mut due: Vec<_> = TimerKind::VALUES
            .iter()
            .filter_map(|&kind| match self.slots[kind as usize] {
                Some(a) if a.deadline <= now => Some((
                    a.deadline,
                    TimerToken {
                        kind,
                        generation: a.generation,
                    },
                )),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(d, _)| *d);
        due.into_iter().map(|(_, t)| t).collect()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|a| a.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_invalidates_old_token() {
        let mut t = TimerTable::new();
        let old = t.start(TimerKind::Final, Duration::from_millis(500));
        let new = t.start(TimerKind::Final, Duration::from_millis(1000));
        assert!(!t.fire(old));
        assert_eq!(t.duration(TimerKind::Final), Some(Duration::from_millis(1000)));
        assert!(t.fire(new));
        assert!(!t.is_running(TimerKind::Final));
        assert!(!t.fire(new));
    }

    #[test]
    fn due_in_deadline_order() {
        let mut t = TimerTable::new();
        let now = Instant::now();
        t.start_at(TimerKind::Poll, Duration::from_millis(30), now);
        t.start_at(TimerKind::Watchdog, Duration::from_millis(10), now);
        t.start_at(TimerKind::Slot, Duration::from_millis(90), now);
        assert_eq!(t.next_deadline(), Some(now + Duration::from_millis(10)));
        let due = t.due(now + Duration::from_millis(50));
        assert_eq!(
            due.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TimerKind::Watchdog, TimerKind::Poll]
        );
        // Restarted while the first one was handled.
        t.start_at(TimerKind::Poll, Duration::from_millis(30), now);
        assert!(t.fire(due[0]));
        assert!(!t.fire(due[1]));
        assert!(t.is_running(TimerKind::Poll));
        assert!(t.is_running(TimerKind::Slot));
    }

    #[test]
    fn stop() {
        let mut t = TimerTable::new();
        let tok = t.start(TimerKind::Backoff, Duration::from_millis(20));
        t.stop(TimerKind::Backoff);
        assert!(!t.fire(tok));
        assert_eq!(t.next_deadline(), None);
    }
}
