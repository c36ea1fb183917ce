use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Start marker of every request and response frame.
pub const START_BYTE: u8 = 0xDD;
/// Stop marker of every request and response frame.
pub const STOP_BYTE: u8 = 0x77;

/// Return code reported by the peripheral on success.
pub const RETURN_OK: u8 = 0x00;

/// Maximum payload length a response may declare.
pub const MAX_RESPONSE_PAYLOAD: usize = 64;

/// The checksum is only defined for payloads shorter than this.
pub const CHECKSUM_LENGTH_LIMIT: u8 = 31;

/// Most cells a pack can report, and the capacity of the balance bitmap.
pub const MAX_CELLS: usize = 32;

const REQUEST_HEADER_LEN: usize = 4;

// Slow RS485 adapters need time to switch between driving and listening,
// and the BMS itself wants the bus quiet between exchanges.
pub const DEFAULT_COMMAND_DELAY: std::time::Duration = std::time::Duration::from_millis(60);

/// Second byte of a request, selecting read or write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Read = 0xA5,
    Write = 0x5A,
}

/// Command codes understood by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Status = 0x03,
    Cells = 0x04,
    Hardware = 0x05,
    Mosfet = 0xE1,
}

/// Computes the 16-bit additive-inverse checksum over a tag byte, a length
/// byte and the first `length` payload bytes.
///
/// This is not a polynomial CRC: the accumulator starts at zero and each
/// input byte is subtracted with wrapping 16-bit arithmetic. The result is
/// transmitted big-endian on the wire.
///
/// The computation is only defined for `length < 31` with the payload
/// actually covering `length` bytes; any other input yields the sentinel 0.
/// The sentinel collides with the legitimate checksum of a zero-tag,
/// zero-length input, so a zero result is inherently ambiguous. That is a
/// quirk of the device protocol and is left as is.
pub fn checksum(tag: u8, length: u8, payload: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    if length < CHECKSUM_LENGTH_LIMIT && usize::from(length) <= payload.len() {
        crc = crc.wrapping_sub(u16::from(tag));
        crc = crc.wrapping_sub(u16::from(length));
        for byte in &payload[..usize::from(length)] {
            crc = crc.wrapping_sub(u16::from(*byte));
        }
    }
    crc
}

/// Builds a complete request frame: start marker, direction, command,
/// length, payload, big-endian checksum, stop marker.
///
/// Fails with [`Error::RequestChecksum`] when the checksum engine cannot
/// produce a value for the payload, meaning no frame can be formed safely.
pub fn build_request(
    direction: Direction,
    command: Command,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    if payload.len() >= usize::from(CHECKSUM_LENGTH_LIMIT) {
        return Err(Error::RequestChecksum);
    }
    let length = payload.len() as u8;
    let crc = checksum(command as u8, length, payload);
    if crc == 0 {
        return Err(Error::RequestChecksum);
    }

    let mut frame = Vec::with_capacity(REQUEST_HEADER_LEN + payload.len() + 3);
    frame.push(START_BYTE);
    frame.push(direction as u8);
    frame.push(command as u8);
    frame.push(length);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.push(STOP_BYTE);
    Ok(frame)
}

/// The fixed three-byte header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub start: u8,
    pub code: u8,
    pub length: u8,
}

impl ResponseHeader {
    pub const SIZE: usize = 3;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            start: bytes[0],
            code: bytes[1],
            length: bytes[2],
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        [self.start, self.code, self.length]
    }

    /// Checks the frame-level invariants that can be judged from the header
    /// alone, before any payload bytes are read.
    pub fn validate(&self) -> Result<(), Error> {
        if self.start != START_BYTE {
            log::warn!("Invalid start marker - received={:02X?}", self.start);
            return Err(Error::StartMarker(self.start));
        }
        if usize::from(self.length) > MAX_RESPONSE_PAYLOAD {
            log::warn!("Declared payload too long - length={}", self.length);
            return Err(Error::PayloadLength(self.length));
        }
        Ok(())
    }
}

/// Validates a received response: start marker, declared length, payload
/// availability, checksum, return code. The first violated condition in
/// that order decides the error.
pub fn validate_response(
    header: &ResponseHeader,
    payload: &[u8],
    received_checksum: u16,
) -> Result<(), Error> {
    header.validate()?;
    if payload.len() != usize::from(header.length) {
        return Err(Error::ResponseBuffer {
            needed: header.length,
            capacity: payload.len(),
        });
    }
    let computed = checksum(header.code, header.length, payload);
    if computed != received_checksum {
        log::warn!(
            "Invalid checksum - calculated={computed:04X?} received={received_checksum:04X?}"
        );
        return Err(Error::Checksum {
            computed,
            received: received_checksum,
        });
    }
    if header.code != RETURN_OK {
        return Err(Error::ReturnCode(header.code));
    }
    Ok(())
}

// Big-endian field readers. Out-of-range reads yield zero so short records
// decode with their trailing fields cleared.

fn be_u16(payload: &[u8], offset: usize) -> u16 {
    match payload.get(offset..offset + 2) {
        Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
        None => 0,
    }
}

fn be_i16(payload: &[u8], offset: usize) -> i16 {
    be_u16(payload, offset) as i16
}

fn byte(payload: &[u8], offset: usize) -> u8 {
    payload.get(offset).copied().unwrap_or(0)
}

macro_rules! read_bit {
    ($word:expr,$position:expr) => {
        ($word >> $position) & 1 != 0
    };
}

/// State of the charge and discharge switches, two bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mosfet {
    Off = 0b00,
    Charge = 0b01,
    Discharge = 0b10,
    Both = 0b11,
}

impl Mosfet {
    pub fn from_bits(bits: u8) -> Self {
        match bits & Mosfet::Both as u8 {
            0b01 => Mosfet::Charge,
            0b10 => Mosfet::Discharge,
            0b11 => Mosfet::Both,
            _ => Mosfet::Off,
        }
    }

    pub fn from_switches(charge: bool, discharge: bool) -> Self {
        Self::from_bits((charge as u8) | (discharge as u8) << 1)
    }

    pub fn charge_enabled(self) -> bool {
        self as u8 & Mosfet::Charge as u8 != 0
    }

    pub fn discharge_enabled(self) -> bool {
        self as u8 & Mosfet::Discharge as u8 != 0
    }
}

/// Temperature sample in deci-Kelvin, as reported by an NTC sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Temperature(pub u16);

impl Temperature {
    pub fn deci_kelvin(self) -> u16 {
        self.0
    }

    pub fn deci_celsius(self) -> i16 {
        self.0 as i16 - 2731
    }
}

/// Production date packed as |7 bits year since 2000|4 bits month|5 bits day|.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionDate(pub u16);

impl ProductionDate {
    pub fn year(self) -> u16 {
        (self.0 >> 9) + 2000
    }

    pub fn month(self) -> u8 {
        (self.0 >> 5 & 0xF) as u8
    }

    pub fn day(self) -> u8 {
        (self.0 & 0x1F) as u8
    }
}

impl fmt::Display for ProductionDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

/// Active fault protections, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fault(pub u16);

/// A single decoded fault protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    CellOvervoltage,
    CellUndervoltage,
    PackOvervoltage,
    PackUndervoltage,
    ChargeOvertemperature,
    ChargeUndertemperature,
    DischargeOvertemperature,
    DischargeUndertemperature,
    ChargeOvercurrent,
    DischargeOvercurrent,
    ShortCircuit,
    IcError,
    MosfetSoftwareLock,
}

impl Fault {
    pub fn is_cell_overvoltage(self) -> bool {
        read_bit!(self.0, 0)
    }
    pub fn is_cell_undervoltage(self) -> bool {
        read_bit!(self.0, 1)
    }
    pub fn is_pack_overvoltage(self) -> bool {
        read_bit!(self.0, 2)
    }
    pub fn is_pack_undervoltage(self) -> bool {
        read_bit!(self.0, 3)
    }
    pub fn is_charge_overtemperature(self) -> bool {
        read_bit!(self.0, 4)
    }
    pub fn is_charge_undertemperature(self) -> bool {
        read_bit!(self.0, 5)
    }
    pub fn is_discharge_overtemperature(self) -> bool {
        read_bit!(self.0, 6)
    }
    pub fn is_discharge_undertemperature(self) -> bool {
        read_bit!(self.0, 7)
    }
    pub fn is_charge_overcurrent(self) -> bool {
        read_bit!(self.0, 8)
    }
    pub fn is_discharge_overcurrent(self) -> bool {
        read_bit!(self.0, 9)
    }
    pub fn is_short_circuit(self) -> bool {
        read_bit!(self.0, 10)
    }
    pub fn is_ic_error(self) -> bool {
        read_bit!(self.0, 11)
    }
    pub fn is_mosfet_software_lock(self) -> bool {
        read_bit!(self.0, 12)
    }

    /// All currently active protections.
    pub fn codes(self) -> Vec<FaultCode> {
        let mut result = Vec::new();

        macro_rules! ck_and_add {
            ($position:expr,$enum_type:expr) => {
                if read_bit!(self.0, $position) {
                    result.push($enum_type);
                }
            };
        }

        ck_and_add!(0, FaultCode::CellOvervoltage);
        ck_and_add!(1, FaultCode::CellUndervoltage);
        ck_and_add!(2, FaultCode::PackOvervoltage);
        ck_and_add!(3, FaultCode::PackUndervoltage);
        ck_and_add!(4, FaultCode::ChargeOvertemperature);
        ck_and_add!(5, FaultCode::ChargeUndertemperature);
        ck_and_add!(6, FaultCode::DischargeOvertemperature);
        ck_and_add!(7, FaultCode::DischargeUndertemperature);
        ck_and_add!(8, FaultCode::ChargeOvercurrent);
        ck_and_add!(9, FaultCode::DischargeOvercurrent);
        ck_and_add!(10, FaultCode::ShortCircuit);
        ck_and_add!(11, FaultCode::IcError);
        ck_and_add!(12, FaultCode::MosfetSoftwareLock);

        result
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultCode::CellOvervoltage => write!(f, "Cell overvoltage protection"),
            FaultCode::CellUndervoltage => write!(f, "Cell undervoltage protection"),
            FaultCode::PackOvervoltage => write!(f, "Pack overvoltage protection"),
            FaultCode::PackUndervoltage => write!(f, "Pack undervoltage protection"),
            FaultCode::ChargeOvertemperature => write!(f, "Overtemperature while charging"),
            FaultCode::ChargeUndertemperature => write!(f, "Undertemperature while charging"),
            FaultCode::DischargeOvertemperature => write!(f, "Overtemperature while discharging"),
            FaultCode::DischargeUndertemperature => write!(f, "Undertemperature while discharging"),
            FaultCode::ChargeOvercurrent => write!(f, "Charge overcurrent protection"),
            FaultCode::DischargeOvercurrent => write!(f, "Discharge overcurrent protection"),
            FaultCode::ShortCircuit => write!(f, "Short circuit protection"),
            FaultCode::IcError => write!(f, "AFE chip error"),
            FaultCode::MosfetSoftwareLock => write!(f, "MOSFET software lock"),
        }
    }
}

/// Pack telemetry returned by the STATUS command.
///
/// All quantities keep the raw device units: voltage in 10 mV, current in
/// 10 mA (positive while charging), capacities in 10 mAh. Payloads shorter
/// than the full record leave the trailing fields at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub voltage: u16,
    pub current: i16,
    pub remaining_capacity: u16,
    pub nominal_capacity: u16,
    pub cycles: u16,
    pub production_date: ProductionDate,
    /// Balance bits of cells 1..=16, one bit per cell.
    pub balance_low: u16,
    /// Balance bits of cells 17..=32.
    pub balance_high: u16,
    pub fault: Fault,
    pub version: u8,
    /// Remaining charge in percent.
    pub capacity_percent: u8,
    pub mosfet: Mosfet,
    pub cells: u8,
    /// NTC temperatures, at most eight.
    pub temperatures: Vec<Temperature>,
}

impl Status {
    const NTC_OFFSET: usize = 23;
    const MAX_NTCS: usize = 8;

    pub fn request() -> Result<Vec<u8>, Error> {
        build_request(Direction::Read, Command::Status, &[])
    }

    pub fn decode(payload: &[u8]) -> Self {
        let ntcs = usize::from(byte(payload, 22)).min(Self::MAX_NTCS);
        let temperatures = (0..ntcs)
            .map(|n| Temperature(be_u16(payload, Self::NTC_OFFSET + 2 * n)))
            .collect();
        Self {
            voltage: be_u16(payload, 0),
            current: be_i16(payload, 2),
            remaining_capacity: be_u16(payload, 4),
            nominal_capacity: be_u16(payload, 6),
            cycles: be_u16(payload, 8),
            production_date: ProductionDate(be_u16(payload, 10)),
            balance_low: be_u16(payload, 12),
            balance_high: be_u16(payload, 14),
            fault: Fault(be_u16(payload, 16)),
            version: byte(payload, 18),
            capacity_percent: byte(payload, 19),
            mosfet: Mosfet::from_bits(byte(payload, 20)),
            cells: byte(payload, 21),
            temperatures,
        }
    }

    /// One `'1'` or `'0'` per cell, least significant bit first.
    pub fn balance_text(&self) -> String {
        balance_text(self.cells, self.balance_low, self.balance_high)
    }
}

/// Per-cell voltages returned by the CELLS command, in millivolts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cells {
    pub voltages: Vec<u16>,
}

impl Cells {
    pub fn request() -> Result<Vec<u8>, Error> {
        build_request(Direction::Read, Command::Cells, &[])
    }

    pub fn decode(payload: &[u8]) -> Self {
        Self {
            voltages: payload
                .chunks_exact(2)
                .take(MAX_CELLS)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        }
    }
}

/// Hardware identification text returned by the HARDWARE command.
///
/// Treated as opaque text; nothing in it is byte-swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    pub id: String,
}

impl Hardware {
    pub fn request() -> Result<Vec<u8>, Error> {
        build_request(Direction::Read, Command::Hardware, &[])
    }

    pub fn decode(payload: &[u8]) -> Self {
        Self {
            id: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// The MOSFET write command.
pub struct SetMosfet;

impl SetMosfet {
    /// Builds the request for the desired switch state.
    ///
    /// The wire protocol expects disable semantics, so the two state bits
    /// are inverted before transmission, after a reserved zero byte.
    pub fn request(state: Mosfet) -> Result<Vec<u8>, Error> {
        let inverted = !(state as u8) & Mosfet::Both as u8;
        build_request(Direction::Write, Command::Mosfet, &[0x00, inverted])
    }
}

/// Renders a cell-balancing bitmap as text, one character per cell,
/// least significant bit first, `'1'` where the cell is balancing.
/// Truncated to [`MAX_CELLS`] characters. Returns a fresh allocation per
/// call.
pub fn balance_text(cells: u8, low: u16, high: u16) -> String {
    let bits = u32::from(high) << 16 | u32::from(low);
    (0..usize::from(cells).min(MAX_CELLS))
        .map(|n| if read_bit!(bits, n) { '1' } else { '0' })
        .collect()
}
