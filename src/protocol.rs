//! NMEA 0183 sentence parser for AIVDM/AIVDO.
//!
//! ```text
//! !AIVDM,<total>,<fragment>,<multipart id>,<channel>,<payload>,<fill bits>*<checksum>
//! ```
//!
//! The checksum is the XOR of every byte between `!` and `*`, written as two
//! hex digits. Lines that fail any check are rejected; the caller logs and
//! moves on.

use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SentenceError {
    #[error("Sentence does not start with '!'")]
    MissingStart,
    #[error("Sentence has no checksum delimiter")]
    MissingChecksum,
    #[error("Invalid checksum digits: {0:?}")]
    InvalidChecksumDigits(String),
    #[error("Checksum mismatch: computed {computed:02X}, sentence says {declared:02X}")]
    ChecksumMismatch { computed: u8, declared: u8 },
    #[error("Sentence is not ASCII")]
    NotAscii,
    #[error("Expected 7 fields, got {0}")]
    FieldCount(usize),
    #[error("Unsupported sentence type: {0}")]
    UnsupportedType(String),
    #[error("Invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("Fragment {fragment} out of range for {total} fragments")]
    FragmentOutOfRange { fragment: u8, total: u8 },
}

/// Number of comma-separated fields between `!` and `*`.
const FIELD_COUNT: usize = 7;
/// Largest legal fill-bit count.
const MAX_FILL_BITS: u8 = 5;

/// A checksum-validated AIVDM/AIVDO sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// `true` for AIVDO (own-ship report)
    pub own_ship: bool,
    pub total_fragments: u8,
    pub fragment_number: u8,
    pub multipart_id: Option<u32>,
    pub channel: Option<char>,
    pub payload: String,
    pub fill_bits: u8,
}

impl Sentence {
    pub fn is_multipart(&self) -> bool {
        self.total_fragments != 1
    }

    pub fn is_last_fragment(&self) -> bool {
        self.fragment_number == self.total_fragments
    }

    /// Render back to wire form, checksum included.
    pub fn to_line(&self) -> String {
        let mut body = String::with_capacity(self.payload.len() + 24);
        let _ = write!(
            body,
            "AIVD{},{},{},",
            if self.own_ship { 'O' } else { 'M' },
            self.total_fragments,
            self.fragment_number
        );
        if let Some(id) = self.multipart_id {
            let _ = write!(body, "{id}");
        }
        body.push(',');
        if let Some(channel) = self.channel {
            body.push(channel);
        }
        let _ = write!(body, ",{},{}", self.payload, self.fill_bits);
        format!("!{}*{:02X}", body, checksum(body.as_bytes()))
    }
}

/// XOR of all bytes.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Parse and validate one sentence line.
pub fn parse_sentence(line: &[u8]) -> Result<Sentence, SentenceError> {
    let line = line.trim_ascii();
    let rest = line.strip_prefix(b"!").ok_or(SentenceError::MissingStart)?;

    let star = rest
        .iter()
        .rposition(|&b| b == b'*')
        .ok_or(SentenceError::MissingChecksum)?;
    let (body, tail) = (&rest[..star], &rest[star + 1..]);

    let declared = parse_checksum_digits(tail)?;
    let computed = checksum(body);
    if computed != declared {
        return Err(SentenceError::ChecksumMismatch { computed, declared });
    }

    let body = std::str::from_utf8(body)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or(SentenceError::NotAscii)?;

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() != FIELD_COUNT {
        return Err(SentenceError::FieldCount(fields.len()));
    }

    let own_ship = match fields[0] {
        "AIVDM" => false,
        "AIVDO" => true,
        other => return Err(SentenceError::UnsupportedType(other.to_string())),
    };

    let total_fragments = parse_count("total fragments", fields[1])?;
    let fragment_number = parse_count("fragment number", fields[2])?;
    if total_fragments == 0 || fragment_number == 0 || fragment_number > total_fragments {
        return Err(SentenceError::FragmentOutOfRange {
            fragment: fragment_number,
            total: total_fragments,
        });
    }

    let multipart_id = match fields[3] {
        "" => None,
        id => Some(parse_digits("multipart id", id)?),
    };

    let channel = {
        let mut chars = fields[4].chars();
        match (chars.next(), chars.next()) {
            (None, _) => None,
            (Some(c), None) if c.is_ascii_alphanumeric() => Some(c),
            _ => {
                return Err(SentenceError::InvalidField {
                    field: "channel",
                    value: fields[4].to_string(),
                })
            }
        }
    };

    let fill_bits = parse_count("fill bits", fields[6])?;
    if fields[6].len() != 1 || fill_bits > MAX_FILL_BITS {
        return Err(SentenceError::InvalidField {
            field: "fill bits",
            value: fields[6].to_string(),
        });
    }

    Ok(Sentence {
        own_ship,
        total_fragments,
        fragment_number,
        multipart_id,
        channel,
        payload: fields[5].to_string(),
        fill_bits,
    })
}

fn parse_checksum_digits(tail: &[u8]) -> Result<u8, SentenceError> {
    let invalid = || SentenceError::InvalidChecksumDigits(String::from_utf8_lossy(tail).into_owned());
    if tail.len() != 2 || !tail.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(tail).map_err(|_| invalid())?;
    u8::from_str_radix(digits, 16).map_err(|_| invalid())
}

fn parse_digits(field: &'static str, value: &str) -> Result<u32, SentenceError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SentenceError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| SentenceError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_count(field: &'static str, value: &str) -> Result<u8, SentenceError> {
    let n = parse_digits(field, value)?;
    u8::try_from(n).map_err(|_| SentenceError::InvalidField {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "!AIVDM,1,1,,B,15M67FC000G?ufbE`FepT@3n00Sa,0*5C";

    #[test]
    fn test_parse_single_fragment() {
        let sentence = parse_sentence(SAMPLE.as_bytes()).unwrap();
        assert!(!sentence.own_ship);
        assert_eq!(sentence.total_fragments, 1);
        assert_eq!(sentence.fragment_number, 1);
        assert_eq!(sentence.multipart_id, None);
        assert_eq!(sentence.channel, Some('B'));
        assert_eq!(sentence.payload, "15M67FC000G?ufbE`FepT@3n00Sa");
        assert_eq!(sentence.fill_bits, 0);
        assert!(!sentence.is_multipart());
    }

    #[test]
    fn test_round_trip_to_line() {
        let sentence = Sentence {
            own_ship: true,
            total_fragments: 2,
            fragment_number: 1,
            multipart_id: Some(3),
            channel: Some('A'),
            payload: "55P5TL01VIaAL@7WKO@mBplU@<PDhh000000001S;AJ::4A80?4i@E53".into(),
            fill_bits: 0,
        };
        let line = sentence.to_line();
        assert!(line.starts_with("!AIVDO,2,1,3,A,"));
        assert_eq!(parse_sentence(line.as_bytes()).unwrap(), sentence);
    }

    #[test]
    fn test_lowercase_checksum_and_whitespace() {
        let body = "AIVDM,1,1,,A,13aEOK?P00PD2wVMdLDRhgvL289?,0";
        let line = format!("  !{}*{:02x}\r\n", body, checksum(body.as_bytes()));
        assert!(parse_sentence(line.as_bytes()).is_ok());
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let body = "AIVDM,1,1,,A,13aEOK?P00PD2wVMdLDRhgvL289?,0";
        let bad = checksum(body.as_bytes()) ^ 0x01;
        let line = format!("!{}*{:02X}", body, bad);
        assert!(matches!(
            parse_sentence(line.as_bytes()),
            Err(SentenceError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_grammar_errors() {
        let cases = [
            ("AIVDM,1,1,,A,13aE,0", "no leading bang", false),
            ("AIVDM,1,1,,A,13a,E,0", "eight fields", true),
            ("AIVDM,1,1,,A,13aE", "six fields", true),
            ("GPGGA,1,1,,A,13aE,0", "wrong type", true),
            ("AIVDM,1,1,,A,13aE,6", "fill bits too large", true),
            ("AIVDM,1,3,,A,13aE,0", "fragment beyond total", true),
            ("AIVDM,0,0,,A,13aE,0", "zero fragments", true),
            ("AIVDM,x,1,,A,13aE,0", "non-numeric total", true),
            ("AIVDM,1,1,,AB,13aE,0", "long channel", true),
        ];
        for (body, what, with_bang) in cases {
            let line = format!(
                "{}{}*{:02X}",
                if with_bang { "!" } else { "" },
                body,
                checksum(body.as_bytes())
            );
            assert!(parse_sentence(line.as_bytes()).is_err(), "accepted {what}");
        }
        assert_eq!(
            parse_sentence(b"!AIVDM,1,1,,A,13aE,0"),
            Err(SentenceError::MissingChecksum)
        );
        assert!(matches!(
            parse_sentence(b"!AIVDM,1,1,,A,13aE,0*ZZ"),
            Err(SentenceError::InvalidChecksumDigits(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_valid_checksum_accepted(payload in "[0-9:;<=>?@A-W`a-w]{1,60}", fill in 0u8..=5) {
            let body = format!("AIVDM,1,1,,A,{payload},{fill}");
            let line = format!("!{}*{:02X}", body, checksum(body.as_bytes()));
            let sentence = parse_sentence(line.as_bytes()).unwrap();
            prop_assert_eq!(sentence.payload, payload);
            prop_assert_eq!(sentence.fill_bits, fill);
        }

        #[test]
        fn prop_flipped_payload_byte_rejected(
            payload in "[0-9:;<=>?@A-W`a-w]{1,60}",
            index in any::<prop::sample::Index>(),
            replacement in "[0-9:;<=>?@A-W`a-w]",
        ) {
            let body = format!("AIVDM,1,1,,A,{payload},0");
            let sum = checksum(body.as_bytes());

            let i = index.index(payload.len());
            let new_byte = replacement.as_bytes()[0];
            prop_assume!(payload.as_bytes()[i] != new_byte);
            let mut flipped = payload.clone().into_bytes();
            flipped[i] = new_byte;
            let flipped = String::from_utf8(flipped).unwrap();

            let tampered = format!("!AIVDM,1,1,,A,{flipped},0*{sum:02X}");
            let is_mismatch = matches!(
                parse_sentence(tampered.as_bytes()),
                Err(SentenceError::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }
    }
}
