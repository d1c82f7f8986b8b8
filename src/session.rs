//! Captured sessions and their metadata.
//!
//! A [`SessionRecord`] is the single source of truth for both device downloads
//! and live captures. Export rows and wall-clock views are derived from it on
//! demand and never written back.

use std::time::Duration;

use serde::Serialize;
use time::PrimitiveDateTime;

use crate::parser::Sample;

/// Spacing between points stored on the device.
pub const DEVICE_SAMPLE_INTERVAL_SECS: u32 = 3;

/// Historical column titles of exported sessions, relative time first.
pub const EXPORT_HEADER: [&str; 4] = ["Time [s]", "Finger out", "Pulse rate [bpm]", "SpO2 [%]"];

/// Column titles when times have been rebased to the wall clock.
pub const EXPORT_HEADER_ABSOLUTE: [&str; 4] = ["Time", "Finger out", "Pulse rate [bpm]", "SpO2 [%]"];

/// Summary of the session stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionMetadata {
    pub available: bool,
    pub duration: Duration,
    pub expected_point_count: usize,
}

impl SessionMetadata {
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Metadata for an available session of the given length.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            available: true,
            duration,
            expected_point_count: expected_points(duration),
        }
    }
}

/// Number of points the device recorded over `duration`.
///
/// Halves round to even, matching how the vendor software reports counts.
pub fn expected_points(duration: Duration) -> usize {
    let points = duration.as_secs_f64() / f64::from(DEVICE_SAMPLE_INTERVAL_SECS);
    points.round_ties_even() as usize
}

/// One recorded point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionEntry {
    pub elapsed_seconds: f64,
    pub finger_present: bool,
    pub pulse_bpm: u8,
    pub spo2_pct: u8,
}

impl SessionEntry {
    pub fn new(elapsed_seconds: f64, sample: Sample) -> Self {
        Self {
            elapsed_seconds,
            finger_present: sample.finger_present,
            pulse_bpm: sample.pulse_bpm,
            spo2_pct: sample.spo2_pct,
        }
    }

    /// `"Y"` or `"N"`, as found in exported files.
    pub fn finger_flag(&self) -> &'static str {
        if self.finger_present {
            "Y"
        } else {
            "N"
        }
    }
}

/// A row as handed to CSV writers and chart renderers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExportRow<T> {
    pub time: T,
    pub finger: &'static str,
    pub pulse_bpm: u8,
    pub spo2_pct: u8,
}

/// Ordered, append-only list of recorded points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRecord {
    entries: Vec<SessionEntry>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point. Points must arrive in chronological order.
    pub fn push(&mut self, elapsed_seconds: f64, sample: Sample) {
        debug_assert!(
            self.last_elapsed().map_or(true, |last| elapsed_seconds >= last),
            "session entries must be chronological"
        );
        self.entries.push(SessionEntry::new(elapsed_seconds, sample));
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last_elapsed(&self) -> Option<f64> {
        self.entries.last().map(|e| e.elapsed_seconds)
    }

    /// Time covered by the record, measured to its last point.
    pub fn duration(&self) -> Duration {
        self.last_elapsed()
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    }

    /// Rows with times relative to the start of the capture.
    pub fn rows(&self) -> impl Iterator<Item = ExportRow<f64>> + '_ {
        self.entries.iter().map(|e| ExportRow {
            time: e.elapsed_seconds,
            finger: e.finger_flag(),
            pulse_bpm: e.pulse_bpm,
            spo2_pct: e.spo2_pct,
        })
    }

    /// Rows with times rebased onto `start`. The record keeps its offsets.
    pub fn rebased(
        &self,
        start: PrimitiveDateTime,
    ) -> impl Iterator<Item = ExportRow<PrimitiveDateTime>> + '_ {
        self.rows().map(move |row| ExportRow {
            time: start + time::Duration::seconds_f64(row.time),
            finger: row.finger,
            pulse_bpm: row.pulse_bpm,
            spo2_pct: row.spo2_pct,
        })
    }

    /// Wall-clock bounds of the record when it started at `start`.
    pub fn span(&self, start: PrimitiveDateTime) -> (PrimitiveDateTime, PrimitiveDateTime) {
        let end = start + time::Duration::seconds_f64(self.last_elapsed().unwrap_or(0.0));
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use time::macros::datetime;

    fn sample(finger_present: bool, pulse_bpm: u8, spo2_pct: u8) -> Sample {
        Sample {
            finger_present,
            pulse_bpm,
            spo2_pct,
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(3, 1)]
    #[case(3_600, 1_200)]
    #[case(4, 1)]
    #[case(5, 2)]
    fn expected_points_divides_by_cadence(#[case] secs: u64, #[case] points: usize) {
        assert_eq!(points, expected_points(Duration::from_secs(secs)));
    }

    #[rstest]
    #[case(4_500, 2)]
    #[case(7_500, 2)]
    #[case(10_500, 4)]
    fn expected_points_rounds_halves_to_even(#[case] millis: u64, #[case] points: usize) {
        assert_eq!(points, expected_points(Duration::from_millis(millis)));
    }

    #[test]
    fn metadata_from_duration_is_available() {
        let meta = SessionMetadata::from_duration(Duration::from_secs(30));
        assert!(meta.available);
        assert_eq!(10, meta.expected_point_count);
        assert_eq!(SessionMetadata::default(), SessionMetadata::unavailable());
    }

    #[test]
    fn rows_keep_order_and_flag_encoding() {
        let mut record = SessionRecord::new();
        record.push(0.0, sample(true, 72, 97));
        record.push(3.0, sample(false, 0, 0));

        let rows: Vec<_> = record.rows().collect();
        assert_eq!(
            vec![
                ExportRow {
                    time: 0.0,
                    finger: "Y",
                    pulse_bpm: 72,
                    spo2_pct: 97
                },
                ExportRow {
                    time: 3.0,
                    finger: "N",
                    pulse_bpm: 0,
                    spo2_pct: 0
                },
            ],
            rows
        );
        assert_eq!(Duration::from_secs(3), record.duration());
    }

    #[test]
    fn rebase_is_a_view() {
        let mut record = SessionRecord::new();
        for (i, pulse) in [60, 61, 62].into_iter().enumerate() {
            record.push(3.0 * i as f64, sample(true, pulse, 98));
        }
        let before = record.clone();
        let start = datetime!(2017-03-04 22:15:00);

        let times: Vec<_> = record.rebased(start).map(|r| r.time).collect();
        assert_eq!(
            vec![
                datetime!(2017-03-04 22:15:00),
                datetime!(2017-03-04 22:15:03),
                datetime!(2017-03-04 22:15:06),
            ],
            times
        );
        assert_eq!(before, record);
        assert_eq!(
            (start, datetime!(2017-03-04 22:15:06)),
            record.span(start)
        );
    }

    #[test]
    fn empty_record_spans_nothing() {
        let record = SessionRecord::new();
        let start = datetime!(2020-01-01 00:00:00);
        assert_eq!((start, start), record.span(start));
        assert_eq!(Duration::ZERO, record.duration());
        assert!(record.is_empty());
    }
}
