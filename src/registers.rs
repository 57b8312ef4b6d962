//! Register map of the power station.
//!
//! The station exposes two disjoint register banks of 80 slots each:
//!
//! - the *telemetry* bank (read-only, answered with message kind `0x1104`)
//! - the *settings* bank (mostly read/write, answered with message kind `0x1103`)
//!
//! Indices are fixed by the device firmware. They collide between banks
//! (index 56 is state of charge in telemetry but the key-sound flag in
//! settings), so a register is only meaningful together with its bank.

use std::fmt;

/// Number of registers requested by each poll (`0x50`)
pub const REGISTER_COUNT: u16 = 80;

/// How a register may be accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
    /// Command registers which act on write and read back as noise
    Write,
}

/// Which bank a register lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Telemetry,
    Settings,
}

/// A named register slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub bank: Bank,
    pub index: u16,
    pub access: Access,
    /// Lowest raw value the device accepts
    pub min: u16,
    /// Highest raw value the device accepts
    pub max: u16,
}

impl Register {
    const fn read(name: &'static str, index: u16) -> Self {
        Self {
            name,
            bank: Bank::Telemetry,
            index,
            access: Access::Read,
            min: 0,
            max: u16::MAX,
        }
    }

    const fn setting(name: &'static str, index: u16, access: Access, min: u16, max: u16) -> Self {
        Self {
            name,
            bank: Bank::Settings,
            index,
            access,
            min,
            max,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.access, Access::ReadWrite | Access::Write)
    }

    /// Clamp a raw value into the range the device accepts for this register
    pub fn clamp(&self, raw: u16) -> u16 {
        raw.clamp(self.min, self.max)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.index)
    }
}

/// Telemetry bank, function code `0x04`
pub mod telemetry {
    use super::Register;

    /// AC input power (W)
    pub const AC_INPUT_WATTS: Register = Register::read("ac_input_watts", 3);
    /// Solar / DC input power (W)
    pub const DC_INPUT_WATTS: Register = Register::read("dc_input_watts", 4);
    /// AC + DC input (W), max 1100
    pub const TOTAL_INPUT_WATTS: Register = Register::read("total_input_watts", 6);
    /// Sum of all outputs including the station's own draw (W)
    pub const TOTAL_POWER: Register = Register::read("total_power", 20);
    /// Battery voltage in V/100
    pub const BATTERY_VOLTAGE: Register = Register::read("battery_voltage", 22);
    /// Output power delivered to loads (W)
    pub const OUTPUT_WATTS: Register = Register::read("output_watts", 39);
    /// Output-enable bitmask, see [`super::Output::status_bit`]
    pub const ACTIVE_OUTPUTS: Register = Register::read("active_outputs", 41);
    /// State of charge in 0.1 %
    pub const STATE_OF_CHARGE: Register = Register::read("state_of_charge", 56);
    pub const MINUTES_TO_FULL: Register = Register::read("minutes_to_full", 58);
    pub const MINUTES_TO_EMPTY: Register = Register::read("minutes_to_empty", 59);

    pub const ALL: [Register; 10] = [
        AC_INPUT_WATTS,
        DC_INPUT_WATTS,
        TOTAL_INPUT_WATTS,
        TOTAL_POWER,
        BATTERY_VOLTAGE,
        OUTPUT_WATTS,
        ACTIVE_OUTPUTS,
        STATE_OF_CHARGE,
        MINUTES_TO_FULL,
        MINUTES_TO_EMPTY,
    ];
}

/// Settings bank, read with function code `0x03`, written with `0x06`
pub mod settings {
    use super::{Access, Register};

    pub const USB_OUTPUT: Register = Register::setting("usb_output", 24, Access::ReadWrite, 0, 1);
    pub const DC_OUTPUT: Register = Register::setting("dc_output", 25, Access::ReadWrite, 0, 1);
    pub const AC_OUTPUT: Register = Register::setting("ac_output", 26, Access::ReadWrite, 0, 1);
    /// 0 off, 1 on, 2 flash, 3 SOS
    pub const LIGHT_MODE: Register = Register::setting("light_mode", 27, Access::ReadWrite, 0, 3);
    pub const KEY_SOUND: Register = Register::setting("key_sound", 56, Access::ReadWrite, 0, 1);
    pub const SILENT_CHARGING: Register =
        Register::setting("silent_charging", 57, Access::ReadWrite, 0, 1);
    /// Minutes, 0 = never
    pub const SCREEN_TIMEOUT: Register =
        Register::setting("screen_timeout", 59, Access::ReadWrite, 0, u16::MAX);
    /// Minutes, 0 = never
    pub const AC_STANDBY: Register = Register::setting("ac_standby", 60, Access::ReadWrite, 0, u16::MAX);
    /// Minutes, 0 = never
    pub const DC_STANDBY: Register = Register::setting("dc_standby", 61, Access::ReadWrite, 0, u16::MAX);
    /// Seconds, 0 = never
    pub const USB_STANDBY: Register =
        Register::setting("usb_standby", 62, Access::ReadWrite, 0, u16::MAX);
    /// Minutes until a scheduled charge starts
    pub const SCHEDULE_CHARGE: Register =
        Register::setting("schedule_charge", 63, Access::ReadWrite, 0, u16::MAX);
    /// Writing 1 shuts the station down
    pub const POWER_OFF: Register = Register::setting("power_off", 64, Access::Write, 1, 1);
    /// Lower state-of-charge limit in 0.1 %, 0-30 %
    pub const DISCHARGE_LIMIT: Register =
        Register::setting("discharge_limit", 66, Access::ReadWrite, 0, 300);
    /// Upper state-of-charge limit in 0.1 %, 60-100 %
    pub const CHARGE_LIMIT: Register =
        Register::setting("charge_limit", 67, Access::ReadWrite, 600, 1000);
    /// Minutes, 0 = never
    pub const SYSTEM_STANDBY: Register =
        Register::setting("system_standby", 68, Access::ReadWrite, 0, u16::MAX);

    pub const ALL: [Register; 15] = [
        USB_OUTPUT,
        DC_OUTPUT,
        AC_OUTPUT,
        LIGHT_MODE,
        KEY_SOUND,
        SILENT_CHARGING,
        SCREEN_TIMEOUT,
        AC_STANDBY,
        DC_STANDBY,
        USB_STANDBY,
        SCHEDULE_CHARGE,
        POWER_OFF,
        DISCHARGE_LIMIT,
        CHARGE_LIMIT,
        SYSTEM_STANDBY,
    ];
}

/// One of the three switchable outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    Usb,
    Dc,
    Ac,
}

impl Output {
    pub const ALL: [Output; 3] = [Output::Usb, Output::Dc, Output::Ac];

    /// Bit of [`telemetry::ACTIVE_OUTPUTS`] reporting whether the output is on
    pub fn status_bit(self) -> u16 {
        match self {
            Output::Usb => 1 << 9,
            Output::Dc => 1 << 10,
            Output::Ac => 1 << 11,
        }
    }

    /// Settings register that switches the output
    pub fn control_register(self) -> Register {
        match self {
            Output::Usb => settings::USB_OUTPUT,
            Output::Dc => settings::DC_OUTPUT,
            Output::Ac => settings::AC_OUTPUT,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Output::Usb => "USB",
            Output::Dc => "DC",
            Output::Ac => "AC",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
fn assert_bank_consistent(bank: Bank, registers: &[Register]) {
    let mut seen = std::collections::HashSet::new();
    for register in registers {
        assert_eq!(register.bank, bank, "{register} is in the wrong bank");
        assert!(register.index < REGISTER_COUNT, "{register} is outside the polled range");
        assert!(seen.insert(register.index), "{register} index used twice");
        assert!(register.min <= register.max, "{register} has an empty range");
    }
}

#[test]
fn test_banks_are_consistent() {
    assert_bank_consistent(Bank::Telemetry, &telemetry::ALL);
    assert_bank_consistent(Bank::Settings, &settings::ALL);
}

#[test]
fn test_telemetry_is_read_only() {
    assert!(telemetry::ALL.iter().all(|r| !r.is_writable()));
    assert!(settings::ALL.iter().all(|r| r.is_writable()));
}

#[test]
fn test_protocol_indices() {
    assert_eq!(telemetry::STATE_OF_CHARGE.index, 56);
    assert_eq!(telemetry::ACTIVE_OUTPUTS.index, 41);
    assert_eq!(telemetry::OUTPUT_WATTS.index, 39);
    assert_eq!(settings::KEY_SOUND.index, 56);
    assert_eq!(settings::POWER_OFF.index, 64);
    assert_eq!(settings::SYSTEM_STANDBY.index, 68);
}

#[test]
fn test_output_bits_are_distinct() {
    assert_eq!(Output::Usb.status_bit(), 512);
    assert_eq!(Output::Dc.status_bit(), 1024);
    assert_eq!(Output::Ac.status_bit(), 2048);
    assert_eq!(Output::Ac.control_register(), settings::AC_OUTPUT);
}

#[test]
fn test_clamp() {
    assert_eq!(settings::CHARGE_LIMIT.clamp(500), 600);
    assert_eq!(settings::CHARGE_LIMIT.clamp(1200), 1000);
    assert_eq!(settings::DISCHARGE_LIMIT.clamp(150), 150);
    assert_eq!(settings::LIGHT_MODE.clamp(9), 3);
    assert_eq!(settings::POWER_OFF.clamp(0), 1);
}
