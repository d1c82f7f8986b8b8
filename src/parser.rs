//! Resynchronising scanner for the live and stored-session sample stream.
//!
//! Samples arrive as 8-byte groups that start with a `0x01` byte. There is no
//! length field and no checksum; the leading `0x01` is the only framing. Any
//! `0x01` restarts the current group, so after a dropped or corrupted byte
//! the scanner is back in step by the next group boundary.
//!
//! ```text
//! index  0     1   2   3        4    5      6     7
//!        0x01  ..  ..  finger   bar  pulse  spo2  ..
//! ```
//!
//! Byte 4 is the pulse-strength bar and is not decoded; pulse and SpO2 follow it.
//!
//! ```text
//! 01 E0 80 C0 AA C8 E1 FF  ->  finger present, 72 bpm, 97 %
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::decode::mask;
use crate::errors::ParseError;
use crate::transport::Transport;

/// Group start marker.
pub const GROUP_START: u8 = 0x01;

/// Bytes per sample group, marker included.
pub const GROUP_LEN: usize = 8;

/// Finger-status value meaning "finger present". Every other value means absent.
pub const FINGER_PRESENT: u8 = 0xC0;

const FINGER_INDEX: usize = 3;
const PULSE_INDEX: usize = 5;
const SPO2_INDEX: usize = 6;

/// One physiological reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub finger_present: bool,
    pub pulse_bpm: u8,
    pub spo2_pct: u8,
}

impl Sample {
    /// Interpret a complete group.
    pub fn from_group(group: &[u8; GROUP_LEN]) -> Self {
        Self {
            finger_present: group[FINGER_INDEX] == FINGER_PRESENT,
            pulse_bpm: mask(group[PULSE_INDEX]),
            spo2_pct: mask(group[SPO2_INDEX]),
        }
    }
}

/// Accumulates stream bytes into sample groups.
#[derive(Debug, Default)]
pub struct SampleParser {
    group: [u8; GROUP_LEN],
    len: usize,
}

impl SampleParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a sample once a group is complete.
    ///
    /// The bytes leading up to the first marker also count as a group, so the
    /// very first sample after a (re)start may be garbage. It is superseded by
    /// real groups as soon as a marker is seen.
    pub fn push(&mut self, byte: u8) -> Option<Sample> {
        if byte == GROUP_START {
            self.len = 0;
        }
        self.group[self.len] = byte;
        self.len += 1;

        if self.len < GROUP_LEN {
            return None;
        }
        self.len = 0;
        Some(Sample::from_group(&self.group))
    }

    /// Drop any partially accumulated group.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Bytes buffered towards the next group.
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Read from `transport` one byte at a time until a sample is complete.
    ///
    /// A read that yields nothing within `timeout` ends the stream: the partial
    /// group is discarded and [`ParseError::StreamEnded`] returned. Callers
    /// decide whether that means "download complete" or "restart the feed".
    pub fn read_sample<T>(&mut self, transport: &mut T, timeout: Duration) -> Result<Sample, ParseError>
    where
        T: Transport + ?Sized,
    {
        let mut byte = [0u8; 1];
        loop {
            if transport.read_timeout(&mut byte, timeout)? == 0 {
                self.reset();
                return Err(ParseError::StreamEnded);
            }
            if let Some(sample) = self.push(byte[0]) {
                return Ok(sample);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use crate::commands::Command;
    use crate::transport::testing::ScriptedTransport;

    /// Pulse-strength bar value used in fixtures. Never equal to a pulse or SpO2 under test.
    const BAR: u8 = 0x80 | 0x2A;

    /// A well-formed group as the device sends it: bar at index 4, pulse at 5, SpO2 at 6.
    pub(crate) fn group(finger_present: bool, pulse: u8, spo2: u8) -> [u8; GROUP_LEN] {
        let finger = if finger_present { FINGER_PRESENT } else { 0x80 };
        [GROUP_START, 0xE0, 0x80, finger, BAR, 0x80 | pulse, 0x80 | spo2, 0xFF]
    }

    pub(crate) fn stream(groups: &[[u8; GROUP_LEN]]) -> Vec<u8> {
        groups.iter().flatten().copied().collect()
    }

    fn feed(parser: &mut SampleParser, bytes: &[u8]) -> Vec<Sample> {
        bytes.iter().filter_map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn decodes_a_single_group() {
        let mut parser = SampleParser::new();
        assert_eq!(
            vec![Sample {
                finger_present: true,
                pulse_bpm: 72,
                spo2_pct: 97
            }],
            feed(&mut parser, &group(true, 72, 97))
        );
        assert_eq!(0, parser.buffered());
    }

    #[test]
    fn pulse_and_spo2_sit_after_the_bar_byte() {
        let captured = [0x01, 0xE0, 0x80, 0xC0, 0xAA, 0xC8, 0xE1, 0xFF];
        assert_eq!(
            Sample {
                finger_present: true,
                pulse_bpm: 72,
                spo2_pct: 97
            },
            Sample::from_group(&captured)
        );
    }

    #[test]
    fn bar_byte_does_not_leak_into_readings() {
        for bar in [0x80, 0x8F, 0xAA, 0xFF] {
            let mut g = group(true, 61, 93);
            g[4] = bar;
            let sample = Sample::from_group(&g);
            assert_eq!((61, 93), (sample.pulse_bpm, sample.spo2_pct));
        }
    }

    #[test]
    fn finger_status_has_exactly_two_outcomes() {
        for status in 0..=255u8 {
            let mut g = group(true, 60, 95);
            g[FINGER_INDEX] = status;
            assert_eq!(status == 0xC0, Sample::from_group(&g).finger_present);
        }
    }

    #[test]
    fn pulse_and_spo2_are_masked() {
        let mut g = group(true, 0, 0);
        g[PULSE_INDEX] = 0xFF;
        g[SPO2_INDEX] = 0x64;
        let sample = Sample::from_group(&g);
        assert_eq!(0x7F, sample.pulse_bpm);
        assert_eq!(100, sample.spo2_pct);
    }

    #[test]
    fn marker_mid_stream_discards_the_truncated_group() {
        let mut bytes = stream(&[group(true, 70, 98)]);
        // A stray marker followed by a partial group, then a clean group.
        bytes.extend([GROUP_START, 0xE0, 0x80]);
        bytes.extend(group(true, 71, 99));

        let mut parser = SampleParser::new();
        let samples = feed(&mut parser, &bytes);
        assert_eq!(2, samples.len());
        assert_eq!((70, 98), (samples[0].pulse_bpm, samples[0].spo2_pct));
        assert_eq!((71, 99), (samples[1].pulse_bpm, samples[1].spo2_pct));
    }

    #[test]
    fn recovers_from_a_dropped_byte() {
        let mut first = group(true, 80, 96).to_vec();
        first.remove(4);
        let mut bytes = first;
        bytes.extend(stream(&[group(true, 81, 97), group(true, 82, 98)]));

        let mut parser = SampleParser::new();
        let samples = feed(&mut parser, &bytes);
        let pulses: Vec<u8> = samples.iter().map(|s| s.pulse_bpm).collect();
        assert_eq!(vec![81, 82], pulses);
    }

    #[test]
    fn leading_noise_yields_at_most_one_artifact() {
        let mut bytes = vec![0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98];
        bytes.extend(stream(&[group(true, 65, 94)]));

        let mut parser = SampleParser::new();
        let samples = feed(&mut parser, &bytes);
        assert_eq!(2, samples.len());
        assert_eq!(65, samples[1].pulse_bpm);
    }

    #[test]
    fn read_sample_reports_stream_end_and_discards_partial_group() {
        let mut bytes = stream(&[group(false, 0, 0)]);
        bytes.extend([GROUP_START, 0xE0]);
        let mut transport = ScriptedTransport::new().reply(Command::GetLiveData, bytes);
        transport.write_all(&Command::GetLiveData.frame()).unwrap();

        let mut parser = SampleParser::new();
        let timeout = Duration::from_millis(100);
        let first = parser.read_sample(&mut transport, timeout).unwrap();
        assert!(!first.finger_present);
        assert_matches!(
            parser.read_sample(&mut transport, timeout),
            Err(ParseError::StreamEnded)
        );
        assert_eq!(0, parser.buffered());
    }

    #[test]
    fn read_sample_skips_stale_bytes_left_on_the_link() {
        let mut transport = ScriptedTransport::new()
            .preload(&[0xF3, 0x9C, 0x85])
            .reply(Command::GetLiveData, stream(&[group(true, 77, 95)]));
        transport.write_all(&Command::GetLiveData.frame()).unwrap();

        let mut parser = SampleParser::new();
        let sample = parser
            .read_sample(&mut transport, Duration::from_millis(100))
            .unwrap();
        assert_eq!((true, 77, 95), (sample.finger_present, sample.pulse_bpm, sample.spo2_pct));
    }

    #[test]
    fn read_sample_propagates_transport_failure() {
        let mut transport = ScriptedTransport::new();
        transport.close().unwrap();
        let mut parser = SampleParser::new();
        assert_matches!(
            parser.read_sample(&mut transport, Duration::from_millis(100)),
            Err(ParseError::Transport(_))
        );
    }
}
