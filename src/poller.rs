//! Read cadences while the link is ready.

use crate::codec::MessageKind;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub telemetry_interval: Duration,
    pub settings_interval: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_secs(30),
            settings_interval: Duration::from_secs(60),
        }
    }
}

/// Two independent timers, one per message kind
#[derive(Debug, Clone)]
pub struct Poller {
    schedule: PollSchedule,
    last_telemetry: Option<Instant>,
    last_settings: Option<Instant>,
}

impl Poller {
    pub fn new(schedule: PollSchedule) -> Self {
        Self {
            schedule,
            last_telemetry: None,
            last_settings: None,
        }
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// Make both reads due immediately; called on entering `Ready`
    pub fn reset(&mut self) {
        self.last_telemetry = None;
        self.last_settings = None;
    }

    /// The reads due at `now`, telemetry first. Returned kinds count as sent.
    pub fn due(&mut self, now: Instant) -> Vec<MessageKind> {
        let mut due = Vec::with_capacity(2);
        if Self::take_due(&mut self.last_telemetry, self.schedule.telemetry_interval, now) {
            due.push(MessageKind::Telemetry);
        }
        if Self::take_due(&mut self.last_settings, self.schedule.settings_interval, now) {
            due.push(MessageKind::Settings);
        }
        due
    }

    fn take_due(last: &mut Option<Instant>, interval: Duration, now: Instant) -> bool {
        let due = match *last {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        };
        if due {
            *last = Some(now);
        }
        due
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(PollSchedule::default())
    }
}

#[test]
fn test_first_tick_is_immediate() {
    let mut poller = Poller::default();
    let now = Instant::now();
    assert_eq!(poller.due(now), vec![MessageKind::Telemetry, MessageKind::Settings]);
    assert!(poller.due(now).is_empty());
}

#[test]
fn test_independent_cadences() {
    let mut poller = Poller::default();
    let t0 = Instant::now();
    poller.due(t0);

    assert!(poller.due(t0 + Duration::from_secs(29)).is_empty());
    assert_eq!(poller.due(t0 + Duration::from_secs(30)), vec![MessageKind::Telemetry]);
    assert!(poller.due(t0 + Duration::from_secs(45)).is_empty());
    assert_eq!(
        poller.due(t0 + Duration::from_secs(60)),
        vec![MessageKind::Telemetry, MessageKind::Settings]
    );
}

#[test]
fn test_reset_restarts_both_timers() {
    let mut poller = Poller::new(PollSchedule {
        telemetry_interval: Duration::from_secs(5),
        settings_interval: Duration::from_secs(300),
    });
    let t0 = Instant::now();
    poller.due(t0);
    poller.reset();
    assert_eq!(
        poller.due(t0 + Duration::from_secs(1)),
        vec![MessageKind::Telemetry, MessageKind::Settings]
    );
}
