//! Per-datagram decode orchestration.
//!
//! For each raw frame: split into lines, validate each sentence, reassemble
//! multipart messages, bit-decode, and stamp the receipt time. Malformed
//! lines and failed decodes are dropped with a diagnostic; nothing here is
//! fatal.

use crate::ais::{AisDecoder, BitDecoder};
use crate::assembler::{Assembly, PartialAssembler, DEFAULT_STALE_AFTER_SECS};
use crate::protocol;
use crate::types::{format_receipt_time, DecodedRecord, FrameOrigin, RawFrame};

/// Counters describing what one frame produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    pub sentences: u64,
    pub rejected: u64,
    pub incomplete: u64,
    pub decode_failures: u64,
    pub aged_out: u64,
}

/// Drives parser, assembler and bit decoder over raw frames.
///
/// Live and replayed frames run on separate clocks, so each origin keeps
/// its own partial-message state.
pub struct DecodeStage<D = AisDecoder> {
    live: PartialAssembler,
    replay: PartialAssembler,
    decoder: D,
}

impl DecodeStage<AisDecoder> {
    pub fn new(stale_after_secs: f64) -> Self {
        Self::with_decoder(stale_after_secs, AisDecoder)
    }
}

impl Default for DecodeStage<AisDecoder> {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER_SECS)
    }
}

impl<D: BitDecoder> DecodeStage<D> {
    pub fn with_decoder(stale_after_secs: f64, decoder: D) -> Self {
        Self {
            live: PartialAssembler::new(stale_after_secs),
            replay: PartialAssembler::new(stale_after_secs),
            decoder,
        }
    }

    fn assembler_for(&mut self, origin: FrameOrigin) -> &mut PartialAssembler {
        match origin {
            FrameOrigin::Live => &mut self.live,
            FrameOrigin::Replay => &mut self.replay,
        }
    }

    /// Decode one frame into zero or more records, in sentence order.
    pub fn process(&mut self, frame: &RawFrame) -> (Vec<DecodedRecord>, FrameOutcome) {
        let mut outcome = FrameOutcome {
            aged_out: self.assembler_for(frame.origin).sweep(frame.receipt_time) as u64,
            ..Default::default()
        };
        let mut records = Vec::new();

        for line in frame.lines() {
            outcome.sentences += 1;

            let sentence = match protocol::parse_sentence(line) {
                Ok(sentence) => sentence,
                Err(e) => {
                    outcome.rejected += 1;
                    tracing::warn!(
                        "Bad NMEA from {}:{} at {}: {} ({})",
                        frame.sender_host,
                        frame.sender_port,
                        frame.receipt_time,
                        String::from_utf8_lossy(line),
                        e
                    );
                    continue;
                }
            };

            let assembled = self
                .assembler_for(frame.origin)
                .accept(sentence, frame.receipt_time);
            let sentence = match assembled {
                Assembly::Complete(sentence) => sentence,
                Assembly::Incomplete => {
                    outcome.incomplete += 1;
                    continue;
                }
            };

            let mut fields = match self.decoder.decode(&sentence.payload, sentence.fill_bits) {
                Ok(fields) => fields,
                Err(e) => {
                    outcome.decode_failures += 1;
                    tracing::debug!("Decode failed for {:?}: {}", sentence.payload, e);
                    continue;
                }
            };

            // Receipt time is authoritative; embedded UTC fragments are dropped.
            fields.timestamp = None;
            fields.utc_hour = None;
            fields.utc_min = None;
            fields.t = format_receipt_time(frame.receipt_time);

            tracing::debug!("Decoded {:?}", fields);
            records.push(DecodedRecord {
                receipt_time: frame.receipt_time,
                fields,
            });
        }

        (records, outcome)
    }

    /// Multipart messages currently awaiting fragments.
    pub fn pending_partials(&self) -> usize {
        self.live.pending() + self.replay.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::{position_report_payload, BitWriter, DecodeError};
    use crate::protocol::Sentence;
    use crate::types::{AisFields, Mmsi};

    fn line(total: u8, number: u8, id: Option<u32>, payload: &str, fill: u8) -> String {
        Sentence {
            own_ship: false,
            total_fragments: total,
            fragment_number: number,
            multipart_id: id,
            channel: Some('A'),
            payload: payload.to_string(),
            fill_bits: fill,
        }
        .to_line()
    }

    fn frame(t: f64, text: &str) -> RawFrame {
        RawFrame::new(t, "10.0.0.7", 8982, text.as_bytes().to_vec())
    }

    /// Stub decoder that returns fixed fields for any payload.
    struct Fixed(AisFields);

    impl BitDecoder for Fixed {
        fn decode(&self, payload: &str, _fill_bits: u8) -> Result<AisFields, DecodeError> {
            if payload == "FAIL" {
                return Err(DecodeError::Unsupported(0));
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_single_sentence_yields_one_record() {
        let (payload, fill) = position_report_payload(123_456_789, -91.5, 28.9, 0.0, 0.0);
        let mut stage = DecodeStage::default();

        let receive_time = 1_623_456_789.25;
        let (records, outcome) = stage.process(&frame(receive_time, &line(1, 1, None, &payload, fill)));

        assert_eq!(records.len(), 1);
        assert_eq!(outcome.sentences, 1);
        let record = &records[0];
        assert_eq!(record.receipt_time, receive_time);
        assert_eq!(record.vessel_id(), Some(Mmsi::new(123_456_789)));
        assert!((record.fields.x.unwrap() - -91.5).abs() < 1e-9);
        assert!((record.fields.y.unwrap() - 28.9).abs() < 1e-9);
        assert_eq!(record.fields.t.as_deref(), Some("2021-06-12 00:13:09"));
    }

    #[test]
    fn test_stub_decoder_fields_pass_through() {
        let fields = AisFields {
            mmsi: Some(Mmsi::new(123_456_789)),
            x: Some(-91.5),
            y: Some(28.9),
            timestamp: Some(42),
            utc_min: Some(7),
            ..Default::default()
        };
        let mut stage = DecodeStage::with_decoder(60.0, Fixed(fields));
        let (records, _) = stage.process(&frame(1000.0, &line(1, 1, None, "anything", 0)));

        assert_eq!(records.len(), 1);
        let got = &records[0].fields;
        assert_eq!(got.mmsi, Some(Mmsi::new(123_456_789)));
        assert_eq!(got.x, Some(-91.5));
        assert_eq!(got.y, Some(28.9));
        assert_eq!(got.timestamp, None);
        assert_eq!(got.utc_min, None);
        assert_eq!(records[0].receipt_time, 1000.0);
    }

    /// Two fragments of a type 5 message from `mmsi`, with the fill bits
    /// of the last one.
    fn static_fragments(mmsi: u64) -> (String, String, u8) {
        let (payload, fill) = BitWriter::new()
            .uint(5, 6)
            .uint(0, 2)
            .uint(mmsi, 30)
            .uint(0, 386)
            .armor();
        let (first, second) = payload.split_at(40);
        (first.to_string(), second.to_string(), fill)
    }

    fn replayed(t: f64, text: &str) -> RawFrame {
        frame(t, text).replayed()
    }

    #[test]
    fn test_multipart_across_frames() {
        let (first, second, fill) = static_fragments(211_222_333);

        let mut stage = DecodeStage::default();
        let (records, outcome) = stage.process(&frame(100.0, &line(2, 1, Some(3), &first, 0)));
        assert!(records.is_empty());
        assert_eq!(outcome.incomplete, 1);
        assert_eq!(stage.pending_partials(), 1);

        let (records, _) = stage.process(&frame(105.0, &line(2, 2, Some(3), &second, fill)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields.id, Some(5));
        assert_eq!(records[0].receipt_time, 105.0);
        assert_eq!(stage.pending_partials(), 0);
    }

    #[test]
    fn test_live_frame_does_not_sweep_replayed_partial() {
        let (first, second, fill) = static_fragments(211_222_333);
        let mut stage = DecodeStage::new(60.0);

        stage.process(&replayed(100.0, &line(2, 1, Some(3), &first, 0)));
        let (_, outcome) = stage.process(&frame(1_700_000_000.0, "garbage"));
        assert_eq!(outcome.aged_out, 0);
        assert_eq!(stage.pending_partials(), 1);

        let (records, _) = stage.process(&replayed(105.0, &line(2, 2, Some(3), &second, fill)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vessel_id(), Some(Mmsi::new(211_222_333)));
        assert_eq!(records[0].receipt_time, 105.0);
        assert_eq!(stage.pending_partials(), 0);
    }

    #[test]
    fn test_live_and_replayed_fragments_never_merge() {
        let (live_first, live_second, live_fill) = static_fragments(211_222_333);
        let (_, replay_second, replay_fill) = static_fragments(999_999_999);
        let mut stage = DecodeStage::new(60.0);

        stage.process(&frame(1_700_000_000.0, &line(2, 1, Some(3), &live_first, 0)));
        let (records, outcome) = stage.process(&replayed(
            1_700_000_001.0,
            &line(2, 2, Some(3), &replay_second, replay_fill),
        ));
        assert!(records.is_empty());
        assert_eq!(outcome.incomplete, 1);
        assert_eq!(stage.pending_partials(), 2);

        let (records, _) = stage.process(&frame(
            1_700_000_002.0,
            &line(2, 2, Some(3), &live_second, live_fill),
        ));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vessel_id(), Some(Mmsi::new(211_222_333)));
        assert_eq!(stage.pending_partials(), 1);
    }

    #[test]
    fn test_abandoned_fragment_swept_by_next_frame() {
        let mut stage = DecodeStage::new(60.0);
        stage.process(&frame(0.0, &line(2, 1, Some(1), "55P5TL01VIaAL@7WKO@mBplU@<PDhh", 0)));
        assert_eq!(stage.pending_partials(), 1);

        stage.process(&frame(30.0, "garbage"));
        assert_eq!(stage.pending_partials(), 1);

        let (_, outcome) = stage.process(&frame(61.0, "garbage"));
        assert_eq!(outcome.aged_out, 1);
        assert_eq!(stage.pending_partials(), 0);
    }

    #[test]
    fn test_bad_lines_do_not_stop_the_frame() {
        let fields = AisFields {
            mmsi: Some(Mmsi::new(1)),
            ..Default::default()
        };
        let mut stage = DecodeStage::with_decoder(60.0, Fixed(fields));
        let good = line(1, 1, None, "OK", 0);
        let mut corrupt = line(1, 1, None, "OK2", 0);
        corrupt.replace_range(14..15, "Z");
        let failing = line(1, 1, None, "FAIL", 0);
        let text = format!("{good}\r\n{corrupt}\n{failing}\nnot nmea\n{good}\n");

        let (records, outcome) = stage.process(&frame(5.0, &text));
        assert_eq!(records.len(), 2);
        assert_eq!(outcome.sentences, 5);
        assert_eq!(outcome.rejected, 2);
        assert_eq!(outcome.decode_failures, 1);
    }
}
