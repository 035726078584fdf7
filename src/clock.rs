//! Time source and session timers
//!
//! The session never reads the wall clock directly; it asks a `Clock`.
//! Production uses `SystemClock`, the test harness drives a virtual clock
//! so timer expiry is deterministic.

use std::rc::Rc;
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The four timers a backend session arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Downstream read idle timeout.
    Read,
    /// Downstream write idle timeout.
    Write,
    /// Waiting for the peer to ACK our SETTINGS.
    SettingsAck,
    /// Idle interval before the connection must prove liveness.
    ConnCheck,
}

const TIMER_SLOTS: usize = 4;

fn slot(kind: TimerKind) -> usize {
    match kind {
        TimerKind::Read => 0,
        TimerKind::Write => 1,
        TimerKind::SettingsAck => 2,
        TimerKind::ConnCheck => 3,
    }
}

fn kind_of(slot: usize) -> TimerKind {
    match slot {
        0 => TimerKind::Read,
        1 => TimerKind::Write,
        2 => TimerKind::SettingsAck,
        _ => TimerKind::ConnCheck,
    }
}

/// Deadline bookkeeping for one session.
///
/// `reset` re-arms a timer at its configured duration from now, `cancel`
/// disarms it, and `take_expired` pops every timer whose deadline has
/// passed. The embedding event loop asks `next_deadline` to know how long
/// it may sleep.
pub struct TimerSet {
    clock: Rc<dyn Clock>,
    durations: [Duration; TIMER_SLOTS],
    deadlines: [Option<Instant>; TIMER_SLOTS],
}

impl TimerSet {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        TimerSet {
            clock,
            durations: [Duration::from_secs(30); TIMER_SLOTS],
            deadlines: [None; TIMER_SLOTS],
        }
    }

    pub fn set_duration(&mut self, kind: TimerKind, duration: Duration) {
        self.durations[slot(kind)] = duration;
    }

    pub fn duration(&self, kind: TimerKind) -> Duration {
        self.durations[slot(kind)]
    }

    /// Arms (or re-arms) the timer for its full duration from now.
    pub fn reset(&mut self, kind: TimerKind) {
        let s = slot(kind);
        self.deadlines[s] = Some(self.clock.now() + self.durations[s]);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[slot(kind)] = None;
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; TIMER_SLOTS];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[slot(kind)].is_some()
    }

    /// Remaining time before `kind` fires, if armed.
    pub fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        let now = self.clock.now();
        self.deadlines[slot(kind)]
            .map(|d| d.saturating_duration_since(now))
    }

    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarms and returns every timer whose deadline has passed.
    pub fn take_expired(&mut self) -> Vec<TimerKind> {
        let now = self.clock.now();
        let mut fired = Vec::new();
        for s in 0..TIMER_SLOTS {
            if let Some(deadline) = self.deadlines[s] {
                if deadline <= now {
                    self.deadlines[s] = None;
                    fired.push(kind_of(s));
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Manually advanced clock.
    pub struct TestClock {
        base: Instant,
        offset: Cell<Duration>,
    }

    impl TestClock {
        pub fn new() -> Self {
            TestClock {
                base: Instant::now(),
                offset: Cell::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }
    }

    #[test]
    fn test_reset_and_expire() {
        let clock = Rc::new(TestClock::new());
        let mut timers = TimerSet::new(clock.clone());
        timers.set_duration(TimerKind::Read, Duration::from_secs(5));
        timers.reset(TimerKind::Read);

        clock.advance(Duration::from_secs(4));
        assert!(timers.take_expired().is_empty());

        clock.advance(Duration::from_secs(2));
        assert_eq!(timers.take_expired(), vec![TimerKind::Read]);
        // One-shot: firing disarms.
        assert!(!timers.is_armed(TimerKind::Read));
    }

    #[test]
    fn test_reset_pushes_deadline_out() {
        let clock = Rc::new(TestClock::new());
        let mut timers = TimerSet::new(clock.clone());
        timers.set_duration(TimerKind::ConnCheck, Duration::from_secs(5));
        timers.reset(TimerKind::ConnCheck);

        clock.advance(Duration::from_secs(4));
        timers.reset(TimerKind::ConnCheck);
        clock.advance(Duration::from_secs(4));
        assert!(timers.take_expired().is_empty());

        clock.advance(Duration::from_secs(2));
        assert_eq!(timers.take_expired(), vec![TimerKind::ConnCheck]);
    }

    #[test]
    fn test_cancel() {
        let clock = Rc::new(TestClock::new());
        let mut timers = TimerSet::new(clock.clone());
        timers.set_duration(TimerKind::SettingsAck, Duration::from_secs(10));
        timers.reset(TimerKind::SettingsAck);
        timers.cancel(TimerKind::SettingsAck);

        clock.advance(Duration::from_secs(20));
        assert!(timers.take_expired().is_empty());
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let clock = Rc::new(TestClock::new());
        let mut timers = TimerSet::new(clock.clone());
        timers.set_duration(TimerKind::Read, Duration::from_secs(30));
        timers.set_duration(TimerKind::ConnCheck, Duration::from_secs(5));
        timers.reset(TimerKind::Read);
        timers.reset(TimerKind::ConnCheck);

        let deadline = timers.next_deadline().unwrap();
        assert_eq!(deadline, clock.now() + Duration::from_secs(5));
    }
}
