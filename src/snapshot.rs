use crate::codec::RegisterTable;
use crate::registers::{settings, telemetry, Output};
use tokio::time::Instant;

/// Which outputs the station reports as switched on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFlags {
    pub usb: bool,
    pub dc: bool,
    pub ac: bool,
}

impl OutputFlags {
    pub fn from_bitmask(bits: u16) -> Self {
        Self {
            usb: bits & Output::Usb.status_bit() != 0,
            dc: bits & Output::Dc.status_bit() != 0,
            ac: bits & Output::Ac.status_bit() != 0,
        }
    }

    pub fn get(&self, output: Output) -> bool {
        match output {
            Output::Usb => self.usb,
            Output::Dc => self.dc,
            Output::Ac => self.ac,
        }
    }

    pub fn set(&mut self, output: Output, on: bool) {
        match output {
            Output::Usb => self.usb = on,
            Output::Dc => self.dc = on,
            Output::Ac => self.ac = on,
        }
    }
}

/// Mode of the built-in LED light
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LightMode {
    #[default]
    Off,
    On,
    Flash,
    Sos,
}

impl LightMode {
    /// Decode a register value, out-of-range values saturate to `Sos`
    pub fn from_raw(raw: u16) -> Self {
        match settings::LIGHT_MODE.clamp(raw) {
            0 => LightMode::Off,
            1 => LightMode::On,
            2 => LightMode::Flash,
            _ => LightMode::Sos,
        }
    }

    pub fn as_raw(self) -> u16 {
        self as u16
    }
}

/// Device configuration as last reported by the station
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// False until at least one settings response has been parsed
    pub received: bool,
    /// Button beep
    pub buzzer_enabled: bool,
    /// Quiet AC charging
    pub silent_charging: bool,
    pub light_mode: LightMode,
    /// Lower state-of-charge limit in %
    pub discharge_limit_pct: u16,
    /// Upper state-of-charge limit in %
    pub charge_limit_pct: u16,
    pub screen_timeout_min: u16,
    pub system_standby_min: u16,
    pub ac_standby_min: u16,
    pub dc_standby_min: u16,
    pub usb_standby_secs: u16,
    /// Minutes until a scheduled charge starts, 0 when none is scheduled
    pub schedule_charge_min: u16,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            received: false,
            buzzer_enabled: true,
            silent_charging: false,
            light_mode: LightMode::Off,
            discharge_limit_pct: 0,
            charge_limit_pct: 100,
            screen_timeout_min: 60,
            system_standby_min: 5,
            ac_standby_min: 60,
            dc_standby_min: 60,
            usb_standby_secs: 300,
            schedule_charge_min: 0,
        }
    }
}

/// The reported state of the power station.
///
/// Values survive a disconnect; `connected` tells whether they are live.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub connected: bool,
    /// True once at least one telemetry response has been parsed
    pub telemetry_received: bool,
    /// When the telemetry fields were last refreshed
    pub updated_at: Option<Instant>,
    /// State of charge in %
    pub battery_percent: f32,
    /// Battery voltage in V
    pub battery_voltage: f32,
    pub ac_input_watts: u16,
    /// Solar / DC input in W
    pub dc_input_watts: u16,
    /// Total input in W
    pub input_watts: u16,
    pub output_watts: u16,
    /// Output power plus the station's own draw in W
    pub total_power_watts: u16,
    pub outputs: OutputFlags,
    /// As estimated by the station
    pub minutes_to_full: u16,
    /// As estimated by the station
    pub minutes_to_empty: u16,
    pub settings: DeviceSettings,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the telemetry fields from a telemetry response
    pub fn apply_telemetry(&mut self, table: &RegisterTable, now: Instant) {
        self.ac_input_watts = table.value(&telemetry::AC_INPUT_WATTS);
        self.dc_input_watts = table.value(&telemetry::DC_INPUT_WATTS);
        self.input_watts = table.value(&telemetry::TOTAL_INPUT_WATTS);
        self.output_watts = table.value(&telemetry::OUTPUT_WATTS);
        self.total_power_watts = table.value(&telemetry::TOTAL_POWER);
        self.battery_voltage = table.value(&telemetry::BATTERY_VOLTAGE) as f32 / 100.0;
        self.battery_percent = table.value(&telemetry::STATE_OF_CHARGE) as f32 / 10.0;
        self.outputs = OutputFlags::from_bitmask(table.value(&telemetry::ACTIVE_OUTPUTS));
        self.minutes_to_full = table.value(&telemetry::MINUTES_TO_FULL);
        self.minutes_to_empty = table.value(&telemetry::MINUTES_TO_EMPTY);
        self.telemetry_received = true;
        self.updated_at = Some(now);
    }

    /// Overwrite the settings fields from a settings response
    pub fn apply_settings(&mut self, table: &RegisterTable) {
        let s = &mut self.settings;
        s.light_mode = LightMode::from_raw(table.value(&settings::LIGHT_MODE));
        s.buzzer_enabled = table.value(&settings::KEY_SOUND) == 1;
        s.silent_charging = table.value(&settings::SILENT_CHARGING) == 1;
        s.screen_timeout_min = table.value(&settings::SCREEN_TIMEOUT);
        s.ac_standby_min = table.value(&settings::AC_STANDBY);
        s.dc_standby_min = table.value(&settings::DC_STANDBY);
        s.usb_standby_secs = table.value(&settings::USB_STANDBY);
        s.schedule_charge_min = table.value(&settings::SCHEDULE_CHARGE);
        s.discharge_limit_pct = table.value(&settings::DISCHARGE_LIMIT) / 10;
        s.charge_limit_pct = table.value(&settings::CHARGE_LIMIT) / 10;
        s.system_standby_min = table.value(&settings::SYSTEM_STANDBY);
        s.received = true;
    }

    /// Mark the data stale after link loss, keeping the last-known values
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }
}

/// Render a duration in minutes as `"2h 5m"`, `"45m"`, or `"--"` for zero
pub fn format_minutes(minutes: u16) -> String {
    match minutes {
        0 => "--".to_string(),
        m if m < 60 => format!("{m}m"),
        m => format!("{}h {}m", m / 60, m % 60),
    }
}

#[cfg(test)]
fn register_table(entries: &[(u16, u16)]) -> RegisterTable {
    let mut values = vec![0u16; crate::registers::REGISTER_COUNT as usize];
    for &(index, value) in entries {
        values[index as usize] = value;
    }
    RegisterTable::from(values)
}

#[test]
fn test_apply_telemetry() {
    let table = register_table(&[
        (3, 600),
        (4, 50),
        (6, 650),
        (20, 140),
        (22, 5120),
        (39, 128),
        (41, 512 | 1024),
        (56, 560),
        (58, 95),
        (59, 0),
    ]);
    let mut snapshot = DeviceSnapshot::new();
    snapshot.apply_telemetry(&table, Instant::now());

    assert!(snapshot.telemetry_received);
    assert_eq!(snapshot.battery_percent, 56.0);
    assert_eq!(snapshot.battery_voltage, 51.2);
    assert_eq!(snapshot.ac_input_watts, 600);
    assert_eq!(snapshot.dc_input_watts, 50);
    assert_eq!(snapshot.input_watts, 650);
    assert_eq!(snapshot.output_watts, 128);
    assert_eq!(snapshot.total_power_watts, 140);
    assert_eq!(snapshot.outputs, OutputFlags { usb: true, dc: true, ac: false });
    assert_eq!(snapshot.minutes_to_full, 95);
    assert_eq!(snapshot.minutes_to_empty, 0);
    assert!(!snapshot.settings.received);
}

#[test]
fn test_output_bits_ignore_neighbours() {
    let flags = OutputFlags::from_bitmask(!(512 | 1024 | 2048));
    assert_eq!(flags, OutputFlags::default());
    let flags = OutputFlags::from_bitmask(2048);
    assert!(flags.ac && !flags.dc && !flags.usb);
}

#[test]
fn test_apply_settings() {
    let table = register_table(&[
        (27, 2),
        (56, 1),
        (57, 0),
        (59, 10),
        (60, 120),
        (61, 0),
        (62, 30),
        (63, 45),
        (66, 150),
        (67, 850),
        (68, 15),
    ]);
    let mut snapshot = DeviceSnapshot::new();
    snapshot.apply_settings(&table);

    let s = &snapshot.settings;
    assert!(s.received);
    assert_eq!(s.light_mode, LightMode::Flash);
    assert!(s.buzzer_enabled);
    assert!(!s.silent_charging);
    assert_eq!(s.screen_timeout_min, 10);
    assert_eq!(s.ac_standby_min, 120);
    assert_eq!(s.dc_standby_min, 0);
    assert_eq!(s.usb_standby_secs, 30);
    assert_eq!(s.schedule_charge_min, 45);
    assert_eq!(s.discharge_limit_pct, 15);
    assert_eq!(s.charge_limit_pct, 85);
    assert_eq!(s.system_standby_min, 15);
    assert!(!snapshot.telemetry_received);
}

#[test]
fn test_disconnect_keeps_values() {
    let mut snapshot = DeviceSnapshot::new();
    snapshot.connected = true;
    snapshot.apply_telemetry(&register_table(&[(56, 731)]), Instant::now());
    snapshot.mark_disconnected();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.battery_percent, 73.1);
}

#[test]
fn test_format_minutes() {
    assert_eq!(format_minutes(0), "--");
    assert_eq!(format_minutes(45), "45m");
    assert_eq!(format_minutes(60), "1h 0m");
    assert_eq!(format_minutes(125), "2h 5m");
}
