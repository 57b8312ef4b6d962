//! Decides when telemetry has changed enough to be worth a downstream refresh.
//!
//! Small swings in the power readings are jitter and are held back. Any
//! state-of-charge step or output toggle goes through, and so does anything
//! after a period of silence.

use crate::snapshot::{DeviceSnapshot, OutputFlags};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Power changes up to and including this many watts are treated as jitter
    pub power_threshold_w: u16,
    /// Publish regardless of change once this much time has passed
    pub staleness: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            power_threshold_w: 3,
            staleness: Duration::from_secs(30),
        }
    }
}

/// The values a consumer was last told about
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastPublished {
    pub battery_percent: f32,
    pub input_watts: u16,
    pub output_watts: u16,
    pub outputs: OutputFlags,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct ChangeGate {
    config: GateConfig,
    last: Option<LastPublished>,
}

impl ChangeGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config, last: None }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn last_published(&self) -> Option<&LastPublished> {
        self.last.as_ref()
    }

    pub fn should_publish(&self, snapshot: &DeviceSnapshot, now: Instant) -> bool {
        if !snapshot.telemetry_received {
            return false;
        }

        let Some(last) = &self.last else {
            return true;
        };

        if snapshot.outputs != last.outputs {
            return true;
        }

        if snapshot.battery_percent != last.battery_percent {
            return true;
        }

        let threshold = self.config.power_threshold_w;
        if snapshot.input_watts.abs_diff(last.input_watts) > threshold
            || snapshot.output_watts.abs_diff(last.output_watts) > threshold
        {
            return true;
        }

        now.saturating_duration_since(last.at) > self.config.staleness
    }

    pub fn mark_published(&mut self, snapshot: &DeviceSnapshot, now: Instant) {
        self.last = Some(LastPublished {
            battery_percent: snapshot.battery_percent,
            input_watts: snapshot.input_watts,
            output_watts: snapshot.output_watts,
            outputs: snapshot.outputs,
            at: now,
        });
    }
}

impl Default for ChangeGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

#[cfg(test)]
fn sample(soc: f32, input: u16, output: u16) -> DeviceSnapshot {
    DeviceSnapshot {
        telemetry_received: true,
        battery_percent: soc,
        input_watts: input,
        output_watts: output,
        ..DeviceSnapshot::default()
    }
}

#[cfg(test)]
fn published_gate(t0: Instant) -> ChangeGate {
    let mut gate = ChangeGate::default();
    gate.mark_published(&sample(50.0, 100, 50), t0);
    gate
}

#[test]
fn test_nothing_to_publish_before_telemetry() {
    let gate = ChangeGate::default();
    assert!(!gate.should_publish(&DeviceSnapshot::default(), Instant::now()));
}

#[test]
fn test_first_sample_publishes() {
    let gate = ChangeGate::default();
    assert!(gate.should_publish(&sample(50.0, 100, 50), Instant::now()));
}

#[test]
fn test_jitter_is_filtered() {
    let t0 = Instant::now();
    let gate = published_gate(t0);
    let now = t0 + Duration::from_secs(10);
    assert!(!gate.should_publish(&sample(50.0, 102, 50), now));
    assert!(!gate.should_publish(&sample(50.0, 100, 47), now));
    assert!(!gate.should_publish(&sample(50.0, 103, 53), now));
}

#[test]
fn test_power_step_publishes() {
    let t0 = Instant::now();
    let gate = published_gate(t0);
    let now = t0 + Duration::from_secs(1);
    assert!(gate.should_publish(&sample(50.0, 105, 50), now));
    assert!(gate.should_publish(&sample(50.0, 100, 45), now));
    assert!(gate.should_publish(&sample(50.0, 96, 50), now));
}

#[test]
fn test_any_soc_change_publishes() {
    let t0 = Instant::now();
    let gate = published_gate(t0);
    assert!(gate.should_publish(&sample(50.1, 100, 50), t0));
    assert!(gate.should_publish(&sample(49.9, 100, 50), t0));
}

#[test]
fn test_output_flip_publishes() {
    let t0 = Instant::now();
    let gate = published_gate(t0);
    let mut snapshot = sample(50.0, 100, 50);
    snapshot.outputs.ac = true;
    assert!(gate.should_publish(&snapshot, t0));
}

#[test]
fn test_staleness_publishes() {
    let t0 = Instant::now();
    let gate = published_gate(t0);
    let snapshot = sample(50.0, 102, 50);
    assert!(!gate.should_publish(&snapshot, t0 + Duration::from_secs(30)));
    assert!(gate.should_publish(&snapshot, t0 + Duration::from_secs(31)));
}

#[test]
fn test_mark_published_moves_baseline() {
    let t0 = Instant::now();
    let mut gate = published_gate(t0);
    let snapshot = sample(50.0, 110, 50);
    assert!(gate.should_publish(&snapshot, t0));
    gate.mark_published(&snapshot, t0);
    assert!(!gate.should_publish(&snapshot, t0));
    assert_eq!(gate.last_published().map(|l| l.input_watts), Some(110));
}

#[test]
fn test_custom_threshold() {
    let t0 = Instant::now();
    let mut gate = ChangeGate::new(GateConfig {
        power_threshold_w: 10,
        staleness: Duration::from_secs(60),
    });
    gate.mark_published(&sample(50.0, 100, 50), t0);
    assert!(!gate.should_publish(&sample(50.0, 108, 50), t0 + Duration::from_secs(45)));
    assert!(gate.should_publish(&sample(50.0, 111, 50), t0 + Duration::from_secs(45)));
}
