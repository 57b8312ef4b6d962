//! Routes inbound notifications into the device snapshot.

use crate::codec::Response;
use crate::snapshot::DeviceSnapshot;
use tokio::time::Instant;
use tracing::debug;

/// What a notification turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Telemetry,
    Settings,
    /// Tag not known to this client, ignored
    Unknown(u16),
    /// Dropped; the next poll resupplies the data
    Malformed(&'static str),
}

pub fn dispatch(data: &[u8], snapshot: &mut DeviceSnapshot, now: Instant) -> Dispatched {
    match Response::decode(data) {
        Response::Telemetry(table) => {
            snapshot.apply_telemetry(&table, now);
            debug!(
                soc = snapshot.battery_percent,
                input_w = snapshot.input_watts,
                output_w = snapshot.output_watts,
                ttf_min = snapshot.minutes_to_full,
                tte_min = snapshot.minutes_to_empty,
                "Telemetry received"
            );
            Dispatched::Telemetry
        }
        Response::Settings(table) => {
            snapshot.apply_settings(&table);
            let s = &snapshot.settings;
            debug!(
                buzzer = s.buzzer_enabled,
                silent = s.silent_charging,
                light = ?s.light_mode,
                charge_limit = s.charge_limit_pct,
                discharge_limit = s.discharge_limit_pct,
                "Settings received"
            );
            Dispatched::Settings
        }
        Response::Unknown(tag) => {
            debug!(tag, len = data.len(), "Ignoring unknown message kind");
            Dispatched::Unknown(tag)
        }
        Response::Malformed(reason) => {
            debug!(reason, data = %hex::encode(data), "Dropping malformed notification");
            Dispatched::Malformed(reason)
        }
    }
}

#[cfg(test)]
use crate::codec::{encode_response, MessageKind};

#[cfg(test)]
fn registers(entries: &[(usize, u16)]) -> Vec<u16> {
    let mut values = vec![0u16; 80];
    for &(index, value) in entries {
        values[index] = value;
    }
    values
}

#[test]
fn test_telemetry_and_settings_write_disjoint_fields() {
    let mut snapshot = DeviceSnapshot::new();
    let now = Instant::now();

    let telemetry = encode_response(MessageKind::Telemetry, &registers(&[(56, 560), (6, 650)]));
    assert_eq!(dispatch(&telemetry, &mut snapshot, now), Dispatched::Telemetry);
    assert_eq!(snapshot.battery_percent, 56.0);
    assert!(!snapshot.settings.received);

    // Register 56 means key sound in the settings bank
    let settings = encode_response(MessageKind::Settings, &registers(&[(56, 0), (67, 900)]));
    assert_eq!(dispatch(&settings, &mut snapshot, now), Dispatched::Settings);
    assert!(snapshot.settings.received);
    assert!(!snapshot.settings.buzzer_enabled);
    assert_eq!(snapshot.settings.charge_limit_pct, 90);
    assert_eq!(snapshot.battery_percent, 56.0);
    assert_eq!(snapshot.input_watts, 650);
}

#[test]
fn test_unknown_kind_is_ignored() {
    let mut snapshot = DeviceSnapshot::new();
    let frame = hex::decode("aa550000000000010002").unwrap();
    assert_eq!(
        dispatch(&frame, &mut snapshot, Instant::now()),
        Dispatched::Unknown(0xaa55)
    );
    assert_eq!(snapshot, DeviceSnapshot::new());
}

#[test]
fn test_short_frame_leaves_snapshot_unchanged() {
    let mut snapshot = DeviceSnapshot::new();
    let now = Instant::now();
    let telemetry = encode_response(MessageKind::Telemetry, &registers(&[(56, 420)]));
    dispatch(&telemetry, &mut snapshot, now);
    let before = snapshot.clone();

    let frame = hex::decode("1104000000000001").unwrap();
    assert!(matches!(
        dispatch(&frame, &mut snapshot, now),
        Dispatched::Malformed(_)
    ));
    assert_eq!(snapshot, before);
}
