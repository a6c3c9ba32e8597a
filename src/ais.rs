//! AIS payload bit decoder.
//!
//! Payloads are armored six bits per character: subtract 48, and subtract
//! another 8 when the result is above 40. The resulting bit string is read
//! MSB-first. Fill bits pad the final character and are dropped.
//!
//! # Supported messages
//!
//! | Type | Content |
//! |------|---------|
//! | 1, 2, 3 | Class A position report |
//! | 4 | Base station report |
//! | 5 | Static and voyage data |
//! | 18 | Class B position report |
//! | 19 | Extended class B position report |
//! | 24 | Class B static data (part A or B) |

use crate::types::{AisFields, Mmsi};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,
    #[error("Invalid payload character {0:?}")]
    InvalidCharacter(char),
    #[error("Fill bits {fill_bits} exceed payload length of {bits} bits")]
    InvalidFillBits { fill_bits: u8, bits: usize },
    #[error("Message type {message_type} too short: need {need} bits, got {got}")]
    TooShort {
        message_type: u8,
        need: usize,
        got: usize,
    },
    #[error("Unsupported message type {0}")]
    Unsupported(u8),
}

/// Turns an assembled payload into decoded fields.
pub trait BitDecoder: Send {
    fn decode(&self, payload: &str, fill_bits: u8) -> Result<AisFields, DecodeError>;
}

/// Decoder for the common position and static message types.
#[derive(Debug, Clone, Copy, Default)]
pub struct AisDecoder;

impl BitDecoder for AisDecoder {
    fn decode(&self, payload: &str, fill_bits: u8) -> Result<AisFields, DecodeError> {
        let bits = BitBuffer::from_payload(payload, fill_bits)?;
        let message_type = bits.uint(0, 6) as u8;

        let need = match message_type {
            1..=3 | 18 => 149,
            4 => 134,
            5 => 420,
            19 => 270,
            24 => 40,
            other => return Err(DecodeError::Unsupported(other)),
        };
        if bits.len() < need {
            return Err(DecodeError::TooShort {
                message_type,
                need,
                got: bits.len(),
            });
        }

        let mut fields = AisFields {
            id: Some(message_type),
            repeat_indicator: Some(bits.uint(6, 2) as u8),
            mmsi: Some(Mmsi::new(bits.uint(8, 30) as u32)),
            ..Default::default()
        };

        match message_type {
            1..=3 => decode_class_a(&bits, &mut fields),
            4 => decode_base_station(&bits, &mut fields),
            5 => decode_static_voyage(&bits, &mut fields),
            18 => decode_class_b(&bits, &mut fields),
            19 => decode_class_b_extended(&bits, &mut fields),
            24 => decode_static_data(&bits, &mut fields)?,
            other => return Err(DecodeError::Unsupported(other)),
        }

        Ok(fields)
    }
}

fn decode_class_a(bits: &BitBuffer, fields: &mut AisFields) {
    fields.nav_status = Some(bits.uint(38, 4) as u8);
    fields.rot = Some(bits.int(42, 8) as i16);
    fields.sog = speed(bits.uint(50, 10));
    fields.position_accuracy = Some(bits.uint(60, 1) as u8);
    fields.x = longitude(bits.int(61, 28));
    fields.y = latitude(bits.int(89, 27));
    fields.cog = course(bits.uint(116, 12));
    fields.true_heading = heading(bits.uint(128, 9));
    fields.timestamp = second(bits.uint(137, 6));
}

fn decode_base_station(bits: &BitBuffer, fields: &mut AisFields) {
    fields.utc_hour = Some(bits.uint(61, 5) as u8).filter(|&h| h < 24);
    fields.utc_min = Some(bits.uint(66, 6) as u8).filter(|&m| m < 60);
    fields.timestamp = second(bits.uint(72, 6));
    fields.position_accuracy = Some(bits.uint(78, 1) as u8);
    fields.x = longitude(bits.int(79, 28));
    fields.y = latitude(bits.int(107, 27));
}

fn decode_static_voyage(bits: &BitBuffer, fields: &mut AisFields) {
    fields.imo_num = Some(bits.uint(40, 30) as u32).filter(|&imo| imo != 0);
    fields.callsign = bits.text(70, 7);
    fields.name = bits.text(112, 20);
    fields.type_and_cargo = Some(bits.uint(232, 8) as u8);
    fields.draught = Some(bits.uint(294, 8) as f64 / 10.0).filter(|&d| d > 0.0);
    fields.destination = bits.text(302, 20);
}

fn decode_class_b(bits: &BitBuffer, fields: &mut AisFields) {
    fields.sog = speed(bits.uint(46, 10));
    fields.position_accuracy = Some(bits.uint(56, 1) as u8);
    fields.x = longitude(bits.int(57, 28));
    fields.y = latitude(bits.int(85, 27));
    fields.cog = course(bits.uint(112, 12));
    fields.true_heading = heading(bits.uint(124, 9));
    fields.timestamp = second(bits.uint(133, 6));
}

fn decode_class_b_extended(bits: &BitBuffer, fields: &mut AisFields) {
    decode_class_b(bits, fields);
    fields.name = bits.text(143, 20);
    fields.type_and_cargo = Some(bits.uint(263, 8) as u8);
}

fn decode_static_data(bits: &BitBuffer, fields: &mut AisFields) -> Result<(), DecodeError> {
    let part = bits.uint(38, 2) as u8;
    fields.part_num = Some(part);
    let need = if part == 0 { 160 } else { 132 };
    if bits.len() < need {
        return Err(DecodeError::TooShort {
            message_type: 24,
            need,
            got: bits.len(),
        });
    }
    if part == 0 {
        fields.name = bits.text(40, 20);
    } else {
        fields.type_and_cargo = Some(bits.uint(40, 8) as u8);
        fields.callsign = bits.text(90, 7);
    }
    Ok(())
}

/// Knots, 1023 = not available.
fn speed(raw: u64) -> Option<f64> {
    (raw != 1023).then(|| raw as f64 / 10.0)
}

/// Degrees, 3600 = not available.
fn course(raw: u64) -> Option<f64> {
    (raw < 3600).then(|| raw as f64 / 10.0)
}

/// Degrees, 511 = not available.
fn heading(raw: u64) -> Option<u16> {
    (raw < 360).then_some(raw as u16)
}

/// Second of minute, 60+ = not available or special.
fn second(raw: u64) -> Option<u8> {
    (raw < 60).then_some(raw as u8)
}

/// 1/10000 minute units, 181 degrees = not available.
fn longitude(raw: i64) -> Option<f64> {
    let degrees = raw as f64 / 600_000.0;
    (degrees.abs() <= 180.0).then_some(degrees)
}

/// 1/10000 minute units, 91 degrees = not available.
fn latitude(raw: i64) -> Option<f64> {
    let degrees = raw as f64 / 600_000.0;
    (degrees.abs() <= 90.0).then_some(degrees)
}

/// De-armored payload bits.
#[derive(Debug)]
struct BitBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl BitBuffer {
    fn from_payload(payload: &str, fill_bits: u8) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut bytes = vec![0u8; (payload.len() * 6).div_ceil(8)];
        let mut bit = 0usize;
        for c in payload.chars() {
            let value = sixbit_value(c).ok_or(DecodeError::InvalidCharacter(c))?;
            for shift in (0..6).rev() {
                if value & (1 << shift) != 0 {
                    bytes[bit / 8] |= 0x80 >> (bit % 8);
                }
                bit += 1;
            }
        }
        let len = bit
            .checked_sub(usize::from(fill_bits))
            .ok_or(DecodeError::InvalidFillBits { fill_bits, bits: bit })?;
        Ok(Self { bytes, len })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn bit(&self, index: usize) -> bool {
        index < self.len && self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Unsigned field; bits past the end read as zero.
    fn uint(&self, start: usize, width: usize) -> u64 {
        (start..start + width).fold(0u64, |acc, i| (acc << 1) | u64::from(self.bit(i)))
    }

    /// Two's complement field.
    fn int(&self, start: usize, width: usize) -> i64 {
        let raw = self.uint(start, width);
        if width > 0 && raw & (1 << (width - 1)) != 0 {
            raw as i64 - (1i64 << width)
        } else {
            raw as i64
        }
    }

    /// Six-bit ASCII text, `@` padding and trailing spaces removed.
    fn text(&self, start: usize, chars: usize) -> Option<String> {
        let s: String = (0..chars)
            .map(|i| {
                let code = self.uint(start + i * 6, 6) as u8;
                if code < 32 {
                    (code + 64) as char
                } else {
                    code as char
                }
            })
            .collect();
        let trimmed = s.split('@').next().unwrap_or("").trim_end();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

fn sixbit_value(c: char) -> Option<u8> {
    match c {
        '0'..='W' => Some(c as u8 - 48),
        '`'..='w' => Some(c as u8 - 56),
        _ => None,
    }
}

/// Armor a bit string (MSB-first, as bools) into payload characters.
/// Returns the payload and the fill-bit count.
pub fn armor(bits: &[bool]) -> (String, u8) {
    let fill = (6 - bits.len() % 6) % 6;
    let payload = bits
        .chunks(6)
        .map(|chunk| {
            let mut value = chunk.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b));
            value <<= 6 - chunk.len();
            if value < 40 {
                (value + 48) as char
            } else {
                (value + 56) as char
            }
        })
        .collect();
    (payload, fill as u8)
}

/// Bit string builder for producing payloads, mainly for tests and
/// simulators.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uint(mut self, value: u64, width: usize) -> Self {
        self.bits
            .extend((0..width).rev().map(|shift| {
                // Widths past 64 bits are zero-padded on the left.
                u32::try_from(shift)
                    .ok()
                    .and_then(|shift| value.checked_shr(shift))
                    .is_some_and(|v| v & 1 == 1)
            }));
        self
    }

    pub fn int(self, value: i64, width: usize) -> Self {
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        self.uint(value as u64 & mask, width)
    }

    pub fn text(mut self, s: &str, chars: usize) -> Self {
        let padded = s.chars().chain(std::iter::repeat('@')).take(chars);
        for c in padded {
            let code = c.to_ascii_uppercase() as u8;
            let value = if code >= 64 { code - 64 } else { code };
            self = self.uint(u64::from(value & 0x3F), 6);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn armor(&self) -> (String, u8) {
        armor(&self.bits)
    }
}

/// Build a type 1 position report payload.
pub fn position_report_payload(
    mmsi: u32,
    lon: f64,
    lat: f64,
    sog_knots: f64,
    cog_degrees: f64,
) -> (String, u8) {
    BitWriter::new()
        .uint(1, 6)
        .uint(0, 2)
        .uint(u64::from(mmsi), 30)
        .uint(0, 4)
        .int(-128, 8)
        .uint((sog_knots * 10.0).round() as u64, 10)
        .uint(1, 1)
        .int((lon * 600_000.0).round() as i64, 28)
        .int((lat * 600_000.0).round() as i64, 27)
        .uint((cog_degrees * 10.0).round() as u64, 12)
        .uint(511, 9)
        .uint(60, 6)
        .uint(0, 2)
        .uint(0, 3)
        .uint(0, 1)
        .uint(0, 19)
        .armor()
}
