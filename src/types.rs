//! Core data types for AIS vessel tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maritime Mobile Service Identity (30-bit vessel id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mmsi(pub u32);

impl Mmsi {
    pub const fn new(id: u32) -> Self {
        Self(id & 0x3FFF_FFFF)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Mmsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a frame entered the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FrameOrigin {
    #[default]
    Live,
    Replay,
}

/// One received datagram, exactly as it came off the wire.
///
/// `receipt_time` is UTC seconds since the epoch, stamped right after
/// the datagram was received (or the stored value, when replayed).
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub receipt_time: f64,
    pub sender_host: String,
    pub sender_port: u16,
    pub payload: Vec<u8>,
    pub origin: FrameOrigin,
}

impl RawFrame {
    pub fn new(
        receipt_time: f64,
        sender_host: impl Into<String>,
        sender_port: u16,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            receipt_time,
            sender_host: sender_host.into(),
            sender_port,
            payload: payload.into(),
            origin: FrameOrigin::Live,
        }
    }

    /// Mark the frame as re-injected from a capture.
    pub fn replayed(mut self) -> Self {
        self.origin = FrameOrigin::Replay;
        self
    }

    /// Iterate the non-empty lines of the payload, `\r` and surrounding
    /// whitespace removed.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.payload
            .split(|&b| b == b'\n')
            .map(|line| line.trim_ascii())
            .filter(|line| !line.is_empty())
    }
}

/// Fields decoded from one AIS message.
///
/// Only the attributes of the supported message types are modelled; every
/// field is optional because each message type carries a different subset
/// and several have "not available" sentinels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AisFields {
    /// Message type (1..=27)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_indicator: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmsi: Option<Mmsi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nav_status: Option<u8>,
    /// Raw rate-of-turn indicator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rot: Option<i16>,
    /// Speed over ground in knots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sog: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_accuracy: Option<u8>,
    /// Longitude in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Latitude in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// Course over ground in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cog: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub true_heading: Option<u16>,
    /// UTC second embedded in the payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_hour: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_min: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imo_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_and_cargo: Option<u8>,
    /// Draught in metres
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draught: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Type 24 part number (0 = A, 1 = B)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_num: Option<u8>,
    /// Normalized receipt time, `%Y-%m-%d %H:%M:%S` UTC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// A fully decoded AIS message stamped with its receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub receipt_time: f64,
    pub fields: AisFields,
}

impl DecodedRecord {
    pub fn vessel_id(&self) -> Option<Mmsi> {
        self.fields.mmsi
    }

    /// Compact JSON of the decoded fields. Serialization is deterministic,
    /// so the same decode always yields the same text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}

/// Current wall-clock time as UTC seconds since the epoch.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Format a receipt time as `%Y-%m-%d %H:%M:%S` UTC, rounded to the
/// nearest second. Returns `None` for times chrono cannot represent.
pub fn format_receipt_time(t: f64) -> Option<String> {
    if !t.is_finite() {
        return None;
    }
    let secs = t.round() as i64;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_lines() {
        let frame = RawFrame::new(0.0, "127.0.0.1", 9, b"  !A\r\n\n!B\n   \n".to_vec());
        let lines: Vec<&[u8]> = frame.lines().collect();
        assert_eq!(lines, vec![b"!A".as_slice(), b"!B".as_slice()]);
    }

    #[test]
    fn test_format_receipt_time() {
        assert_eq!(
            format_receipt_time(1_623_456_789.4).as_deref(),
            Some("2021-06-12 00:13:09")
        );
        assert_eq!(
            format_receipt_time(1_623_456_789.6).as_deref(),
            Some("2021-06-12 00:13:10")
        );
        assert_eq!(format_receipt_time(f64::NAN), None);
    }

    #[test]
    fn test_fields_json_omits_missing() {
        let fields = AisFields {
            id: Some(1),
            mmsi: Some(Mmsi::new(123_456_789)),
            x: Some(-91.5),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&fields).unwrap(),
            r#"{"id":1,"mmsi":123456789,"x":-91.5}"#
        );
    }
}
