//! Wire format of the power station protocol.
//!
//! Requests are Modbus RTU style frames written to the GATT write
//! characteristic:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Device address, always `0x11`
//! 1          | 1        | Function code (`0x03`, `0x04` or `0x06`)
//! 2          | 3        | Register / start register, big endian
//! 4          | 5        | Register count (reads) or value (writes), big endian
//! 6          | 7        | CRC-16/MODBUS over bytes 0-5, **high byte first**
//!
//! Standard Modbus RTU sends the CRC low byte first. This device expects the
//! opposite and silently ignores frames that follow the standard.
//!
//! Responses arrive as notifications:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 1        | Message kind tag, big endian (`0x1104` or `0x1103`)
//! 2          | 5        | Header, not interpreted
//! 6          | ..       | Register values, big endian, two bytes each, from register 0

use crate::error::{Error, Result};
use crate::registers::{Register, REGISTER_COUNT};
use crc16::{State, MODBUS};
use std::fmt;

/// Modbus address of the station
pub const DEVICE_ADDRESS: u8 = 0x11;
/// Offset of register 0 within a response
pub const RESPONSE_HEADER_LEN: usize = 6;
/// Shortest response that carries at least two registers
pub const MIN_RESPONSE_LEN: usize = 10;
/// Length of every request frame
pub const REQUEST_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read multiple holding registers (settings bank)
    ReadHolding = 0x03,
    /// Read multiple input registers (telemetry bank)
    ReadInput = 0x04,
    WriteSingle = 0x06,
}

/// The two response shapes, told apart by their leading tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Telemetry,
    Settings,
}

impl MessageKind {
    pub const fn tag(self) -> u16 {
        match self {
            MessageKind::Telemetry => 0x1104,
            MessageKind::Settings => 0x1103,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0x1104 => Some(MessageKind::Telemetry),
            0x1103 => Some(MessageKind::Settings),
            _ => None,
        }
    }

    /// Read function that makes the station answer with this kind
    pub fn request_function(self) -> FunctionCode {
        match self {
            MessageKind::Telemetry => FunctionCode::ReadInput,
            MessageKind::Settings => FunctionCode::ReadHolding,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Telemetry => f.write_str("telemetry"),
            MessageKind::Settings => f.write_str("settings"),
        }
    }
}

/// A complete request, ready to be written to the outbound characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub address: u8,
    pub function: FunctionCode,
    pub register: u16,
    /// Register count for reads, register value for writes
    pub count_or_value: u16,
    pub checksum: u16,
}

impl RequestFrame {
    fn new(function: FunctionCode, register: u16, count_or_value: u16) -> Self {
        let mut frame = Self {
            address: DEVICE_ADDRESS,
            function,
            register,
            count_or_value,
            checksum: 0,
        };
        frame.checksum = checksum(&frame.payload());
        frame
    }

    /// The six bytes the checksum covers
    pub fn payload(&self) -> [u8; 6] {
        let [reg_hi, reg_lo] = self.register.to_be_bytes();
        let [val_hi, val_lo] = self.count_or_value.to_be_bytes();
        [self.address, self.function as u8, reg_hi, reg_lo, val_hi, val_lo]
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut bytes = [0u8; REQUEST_LEN];
        bytes[..6].copy_from_slice(&self.payload());
        bytes[6..].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

/// Build a read-multiple request for `count` registers from `start`
pub fn build_read_request(function: FunctionCode, start: u16, count: u16) -> RequestFrame {
    RequestFrame::new(function, start, count)
}

/// The full-bank poll for the given message kind
pub fn read_request(kind: MessageKind) -> RequestFrame {
    build_read_request(kind.request_function(), 0, REGISTER_COUNT)
}

pub fn build_write_request(register: u16, value: u16) -> RequestFrame {
    RequestFrame::new(FunctionCode::WriteSingle, register, value)
}

/// Compute the CRC-16/MODBUS check value for the given bytes
pub fn checksum(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Register values carried by one response.
///
/// Reading past the end yields 0 so that truncated responses can still be
/// indexed by register number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterTable(Vec<u16>);

impl RegisterTable {
    pub fn get(&self, index: u16) -> u16 {
        self.0.get(index as usize).copied().unwrap_or(0)
    }

    pub fn value(&self, register: &Register) -> u16 {
        self.get(register.index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[u16] {
        &self.0
    }
}

impl From<Vec<u16>> for RegisterTable {
    fn from(values: Vec<u16>) -> Self {
        Self(values)
    }
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Telemetry(RegisterTable),
    Settings(RegisterTable),
    /// Well-formed length but a tag this client does not know
    Unknown(u16),
    Malformed(&'static str),
}

impl Response {
    pub fn decode(buffer: &[u8]) -> Self {
        let Some(tag) = read_tag(buffer) else {
            return Response::Malformed("Too short");
        };

        match MessageKind::from_tag(tag) {
            Some(MessageKind::Telemetry) => Response::Telemetry(registers(buffer)),
            Some(MessageKind::Settings) => Response::Settings(registers(buffer)),
            None => Response::Unknown(tag),
        }
    }
}

/// Parse a response that is expected to be of the given kind
pub fn parse_response(buffer: &[u8], kind: MessageKind) -> Result<RegisterTable> {
    let tag = read_tag(buffer).ok_or_else(|| {
        Error::Malformed(format!("{} bytes: {}", buffer.len(), hex::encode(buffer)))
    })?;

    match MessageKind::from_tag(tag) {
        Some(actual) if actual == kind => Ok(registers(buffer)),
        Some(actual) => Err(Error::Malformed(format!("expected {kind} response, got {actual}"))),
        None => Err(Error::Malformed(format!("unknown message kind {tag:#06x}"))),
    }
}

fn read_tag(buffer: &[u8]) -> Option<u16> {
    if buffer.len() < MIN_RESPONSE_LEN {
        return None;
    }
    Some(u16::from_be_bytes([buffer[0], buffer[1]]))
}

fn registers(buffer: &[u8]) -> RegisterTable {
    let values = buffer[RESPONSE_HEADER_LEN..]
        .chunks_exact(2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .collect();
    RegisterTable(values)
}

/// Build a response frame the way the station would send it
#[cfg(test)]
pub(crate) fn encode_response(kind: MessageKind, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_HEADER_LEN + values.len() * 2);
    frame.extend_from_slice(&kind.tag().to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame
}

#[test]
fn test_checksum_golden_vector() {
    let payload = [0x11, 0x03, 0x00, 0x00, 0x00, 0x50];
    assert_eq!(checksum(&payload), 0x6647);
}

#[test]
fn test_settings_request_checksum_high_byte_first() {
    let frame = read_request(MessageKind::Settings);
    assert_eq!(frame.to_bytes().to_vec(), hex::decode("1103000000506647").unwrap());
}

#[test]
fn test_telemetry_request() {
    let frame = read_request(MessageKind::Telemetry);
    assert_eq!(frame.function, FunctionCode::ReadInput);
    assert_eq!(frame.count_or_value, 80);
    assert_eq!(frame.to_bytes().to_vec(), hex::decode("110400000050a6f2").unwrap());
}

#[test]
fn test_write_request() {
    let frame = build_write_request(24, 1);
    assert_eq!(frame.to_bytes().to_vec(), hex::decode("1106001800019dca").unwrap());

    let frame = build_write_request(67, 800);
    assert_eq!(frame.to_bytes().to_vec(), hex::decode("110600430320a67b").unwrap());
}

#[test]
fn test_parse_every_register_index() {
    for index in 0..REGISTER_COUNT {
        for value in [0u16, 1, 0x1234, u16::MAX] {
            let mut values = vec![0u16; (index as usize + 1).max(2)];
            values[index as usize] = value;
            let frame = encode_response(MessageKind::Telemetry, &values);
            let table = parse_response(&frame, MessageKind::Telemetry).unwrap();
            assert_eq!(table.get(index), value, "register {index}");
        }
    }
}

#[test]
fn test_parse_too_short() {
    let message = hex::decode("110400000000aabb").unwrap();
    let result = parse_response(&message, MessageKind::Telemetry);
    assert!(matches!(result, Err(Error::Malformed(_))));
    assert_eq!(Response::decode(&message), Response::Malformed("Too short"));
}

#[test]
fn test_parse_unknown_kind() {
    let message = hex::decode("1105000000000001000200030004").unwrap();
    let result = parse_response(&message, MessageKind::Telemetry);
    assert!(matches!(result, Err(Error::Malformed(_))));
    assert_eq!(Response::decode(&message), Response::Unknown(0x1105));
}

#[test]
fn test_parse_kind_mismatch() {
    let message = encode_response(MessageKind::Settings, &[1, 2, 3]);
    assert!(parse_response(&message, MessageKind::Telemetry).is_err());
    assert!(parse_response(&message, MessageKind::Settings).is_ok());
}

#[test]
fn test_partial_table_reads_zero() {
    // Two registers and a dangling byte
    let message = hex::decode("11040000000000070008ff").unwrap();
    let table = parse_response(&message, MessageKind::Telemetry).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(0), 7);
    assert_eq!(table.get(1), 8);
    assert_eq!(table.get(2), 0);
    assert_eq!(table.get(79), 0);
}

#[test]
fn test_decode_routes_by_tag() {
    let telemetry = encode_response(MessageKind::Telemetry, &[5, 6]);
    let settings = encode_response(MessageKind::Settings, &[5, 6]);
    assert_eq!(
        Response::decode(&telemetry),
        Response::Telemetry(RegisterTable::from(vec![5, 6]))
    );
    assert_eq!(
        Response::decode(&settings),
        Response::Settings(RegisterTable::from(vec![5, 6]))
    );
}
