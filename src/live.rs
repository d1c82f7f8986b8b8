//! Live capture: status debouncing and the self-restarting capture loop.
//!
//! The sensor occasionally reports "no finger" for a sample or two while the
//! finger is still in place. [`Debouncer`] only declares
//! [`LiveStatus::FingerOut`] after a run of absent samples longer than the
//! configured threshold, and keeps reporting the last good values until then.
//!
//! The live feed also stalls now and then (roughly every 30 seconds of
//! streaming). [`LiveCapture`] treats that as routine: it greets the device
//! again, re-requests the feed, and only gives up after repeated failures.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::cms50ew::Cms50ew;
use crate::errors::{DriverError, ParseError, Result, TransportError};
use crate::parser::Sample;
use crate::session::SessionRecord;

/// Absent samples tolerated before declaring the finger out.
pub const DEFAULT_FINGER_OUT_THRESHOLD: u32 = 10;

/// Consecutive feed restarts without a sample before the link is declared lost.
const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Minimum spacing of recorded points during live capture.
const DEFAULT_RECORD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub finger_out_threshold: u32,
    pub max_restarts: u32,
    pub record_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            finger_out_threshold: DEFAULT_FINGER_OUT_THRESHOLD,
            max_restarts: DEFAULT_MAX_RESTARTS,
            record_interval: DEFAULT_RECORD_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveStatus {
    Processing,
    FingerOut,
    LowSignalQuality,
}

impl LiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveStatus::Processing => "Processing data",
            LiveStatus::FingerOut => "Finger out",
            LiveStatus::LowSignalQuality => "Low signal quality",
        }
    }
}

/// What to show for one sample. `None` values mean "n/a".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveReading {
    pub sample: Sample,
    pub status: LiveStatus,
    pub pulse_bpm: Option<u8>,
    pub spo2_pct: Option<u8>,
}

impl LiveReading {
    /// The sample as it goes into the session record: reported values, zeros for n/a.
    pub fn recorded_sample(&self) -> Sample {
        Sample {
            finger_present: self.sample.finger_present,
            pulse_bpm: self.pulse_bpm.unwrap_or(0),
            spo2_pct: self.spo2_pct.unwrap_or(0),
        }
    }
}

/// Hysteresis on finger absence.
#[derive(Debug, Clone)]
pub struct Debouncer {
    threshold: u32,
    absent_run: u32,
    last_good: Option<(u8, u8)>,
    status: LiveStatus,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_FINGER_OUT_THRESHOLD)
    }
}

impl Debouncer {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            absent_run: 0,
            last_good: None,
            status: LiveStatus::Processing,
        }
    }

    pub fn status(&self) -> LiveStatus {
        self.status
    }

    pub fn update(&mut self, sample: Sample) -> LiveReading {
        let (status, values) = if !sample.finger_present {
            self.absent_run = self.absent_run.saturating_add(1);
            if self.absent_run > self.threshold {
                (LiveStatus::FingerOut, None)
            } else {
                (LiveStatus::Processing, self.last_good)
            }
        } else {
            self.absent_run = 0;
            if sample.pulse_bpm == 0 || sample.spo2_pct == 0 {
                (LiveStatus::LowSignalQuality, None)
            } else {
                let values = (sample.pulse_bpm, sample.spo2_pct);
                self.last_good = Some(values);
                (LiveStatus::Processing, Some(values))
            }
        };

        if status != self.status {
            debug!("live status: {:?} -> {:?}", self.status, status);
        }
        self.status = status;

        LiveReading {
            sample,
            status,
            pulse_bpm: values.map(|(pulse, _)| pulse),
            spo2_pct: values.map(|(_, spo2)| spo2),
        }
    }
}

/// A live capture in progress. Owns the record it writes.
#[derive(Debug)]
pub struct LiveCapture {
    config: LiveConfig,
    debouncer: Debouncer,
    record: SessionRecord,
}

impl LiveCapture {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            debouncer: Debouncer::new(config.finger_out_threshold),
            config,
            record: SessionRecord::new(),
        }
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn into_record(self) -> SessionRecord {
        self.record
    }

    /// Stream until `on_reading` returns `Break` or the link is lost.
    ///
    /// `on_reading` sees every reading together with the record as it stands;
    /// stopping is only possible between samples. Whatever was recorded stays
    /// in [`record`](Self::record), also after an error.
    pub fn run<F>(mut self, device: &mut Cms50ew, on_reading: F) -> Result<SessionRecord>
    where
        F: FnMut(&LiveReading, &SessionRecord) -> ControlFlow<()>,
    {
        self.capture(device, on_reading)?;
        Ok(self.record)
    }

    pub fn capture<F>(&mut self, device: &mut Cms50ew, mut on_reading: F) -> Result<()>
    where
        F: FnMut(&LiveReading, &SessionRecord) -> ControlFlow<()>,
    {
        self.record.clear();
        device.start_live()?;
        info!("live feed started");

        let started = Instant::now();
        let mut last_recorded: Option<Instant> = None;
        let mut restarts = 0u32;

        loop {
            match device.read_sample() {
                Ok(sample) => {
                    restarts = 0;
                    let reading = self.debouncer.update(sample);

                    let now = Instant::now();
                    let due = last_recorded
                        .map_or(true, |t| now.duration_since(t) >= self.config.record_interval);
                    if due {
                        let elapsed = now.duration_since(started).as_secs_f64();
                        self.record.push(elapsed, reading.recorded_sample());
                        last_recorded = Some(now);
                    }

                    if on_reading(&reading, &self.record).is_break() {
                        info!("live capture stopped: {} points recorded", self.record.len());
                        return Ok(());
                    }
                }
                Err(ParseError::StreamEnded) => {
                    if restarts >= self.config.max_restarts {
                        warn!("live feed did not recover after {} restarts", restarts);
                        return Err(DriverError::ConnectionLost { restarts });
                    }
                    restarts += 1;
                    warn!("live feed stalled, restarting (attempt {})", restarts);
                    match device.start_live() {
                        Ok(()) => {}
                        // The next read will time out again and count as another attempt.
                        Err(DriverError::Transport(TransportError::Timeout(e))) => {
                            warn!("handshake during restart failed: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(ParseError::Transport(e)) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::cms50ew::tests::{device, HELLO_REPLY};
    use crate::commands::Command;
    use crate::parser::tests::{group, stream};
    use crate::transport::testing::ScriptedTransport;

    fn present(pulse_bpm: u8, spo2_pct: u8) -> Sample {
        Sample {
            finger_present: true,
            pulse_bpm,
            spo2_pct,
        }
    }

    fn absent() -> Sample {
        Sample {
            finger_present: false,
            pulse_bpm: 0,
            spo2_pct: 0,
        }
    }

    fn statuses(debouncer: &mut Debouncer, samples: &[Sample]) -> Vec<LiveStatus> {
        samples.iter().map(|&s| debouncer.update(s).status).collect()
    }

    #[test]
    fn ten_absent_samples_never_report_finger_out() {
        let mut debouncer = Debouncer::default();
        let mut samples = vec![present(70, 98)];
        samples.extend([absent(); 10]);
        samples.push(present(71, 98));

        let seen = statuses(&mut debouncer, &samples);
        assert!(seen.iter().all(|&s| s == LiveStatus::Processing), "{seen:?}");
    }

    #[test]
    fn eleventh_absent_sample_reports_finger_out_once() {
        let mut debouncer = Debouncer::default();
        let seen = statuses(&mut debouncer, &[absent(); 11]);
        assert_eq!(LiveStatus::FingerOut, seen[10]);
        assert_eq!(1, seen.iter().filter(|&&s| s == LiveStatus::FingerOut).count());
    }

    #[test]
    fn finger_out_persists_as_a_single_transition() {
        let mut debouncer = Debouncer::default();
        let seen = statuses(&mut debouncer, &[absent(); 15]);
        let transitions = seen.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(1, transitions);
        assert_eq!(LiveStatus::FingerOut, *seen.last().unwrap());
    }

    #[test]
    fn present_sample_resets_the_absent_run() {
        let mut debouncer = Debouncer::default();
        let mut samples = Vec::new();
        for _ in 0..3 {
            samples.extend([absent(); 10]);
            samples.push(present(80, 97));
        }
        assert!(statuses(&mut debouncer, &samples)
            .iter()
            .all(|&s| s != LiveStatus::FingerOut));
    }

    #[test]
    fn debounced_samples_repeat_last_good_values() {
        let mut debouncer = Debouncer::default();
        debouncer.update(present(66, 95));
        let reading = debouncer.update(absent());
        assert_eq!(LiveStatus::Processing, reading.status);
        assert_eq!((Some(66), Some(95)), (reading.pulse_bpm, reading.spo2_pct));
        assert_eq!(present(66, 95).pulse_bpm, reading.recorded_sample().pulse_bpm);
        assert!(!reading.recorded_sample().finger_present);
    }

    #[test]
    fn absent_after_low_quality_repeats_last_good_values() {
        let mut debouncer = Debouncer::default();
        debouncer.update(present(70, 98));
        assert_eq!(LiveStatus::LowSignalQuality, debouncer.update(present(0, 98)).status);

        let reading = debouncer.update(absent());
        assert_eq!(LiveStatus::Processing, reading.status);
        assert_eq!((Some(70), Some(98)), (reading.pulse_bpm, reading.spo2_pct));
        let recorded = reading.recorded_sample();
        assert_eq!((70, 98), (recorded.pulse_bpm, recorded.spo2_pct));
    }

    #[test]
    fn absent_after_recovered_finger_out_repeats_last_good_values() {
        let mut debouncer = Debouncer::new(2);
        debouncer.update(present(64, 96));
        let seen = statuses(&mut debouncer, &[absent(); 3]);
        assert_eq!(LiveStatus::FingerOut, seen[2]);

        let back = debouncer.update(present(66, 97));
        assert_eq!(LiveStatus::Processing, back.status);

        let reading = debouncer.update(absent());
        assert_eq!(LiveStatus::Processing, reading.status);
        assert_eq!((Some(66), Some(97)), (reading.pulse_bpm, reading.spo2_pct));
    }

    #[test]
    fn absent_before_any_good_reading_has_no_values() {
        let mut debouncer = Debouncer::default();
        let reading = debouncer.update(absent());
        assert_eq!(LiveStatus::Processing, reading.status);
        assert_eq!((None, None), (reading.pulse_bpm, reading.spo2_pct));
    }

    #[rstest]
    #[case(0, 97)]
    #[case(72, 0)]
    #[case(0, 0)]
    fn zero_reading_with_finger_is_low_quality(#[case] pulse: u8, #[case] spo2: u8) {
        let mut debouncer = Debouncer::default();
        debouncer.update(present(70, 98));
        let reading = debouncer.update(present(pulse, spo2));
        assert_eq!(LiveStatus::LowSignalQuality, reading.status);
        assert_eq!((None, None), (reading.pulse_bpm, reading.spo2_pct));
    }

    #[test]
    fn finger_out_reports_no_values() {
        let mut debouncer = Debouncer::new(0);
        debouncer.update(present(70, 98));
        let reading = debouncer.update(absent());
        assert_eq!(LiveStatus::FingerOut, reading.status);
        assert_eq!(absent(), reading.recorded_sample());
    }

    #[rstest]
    #[case(10, 11)]
    #[case(20, 21)]
    #[case(0, 1)]
    fn threshold_is_configurable(#[case] threshold: u32, #[case] first_finger_out: usize) {
        let mut debouncer = Debouncer::new(threshold);
        let seen = statuses(&mut debouncer, &vec![absent(); first_finger_out]);
        assert_eq!(LiveStatus::FingerOut, seen[first_finger_out - 1]);
        assert!(seen[..first_finger_out - 1]
            .iter()
            .all(|&s| s == LiveStatus::Processing));
    }

    fn live_device(groups: &[[u8; 8]]) -> ScriptedTransport {
        ScriptedTransport::new()
            .reply(Command::Hello1, HELLO_REPLY)
            .reply(Command::GetLiveData, stream(groups))
    }

    fn every_sample() -> LiveConfig {
        LiveConfig {
            record_interval: Duration::ZERO,
            ..LiveConfig::default()
        }
    }

    #[test]
    fn stalled_feed_is_restarted_transparently() {
        let transport = live_device(&[group(true, 70, 97), group(true, 71, 97), group(true, 72, 97)]);
        let written = transport.written();
        let mut oxi = device(transport);

        let mut pulses = Vec::new();
        let record = oxi
            .live(&every_sample(), |reading, _| {
                pulses.push(reading.pulse_bpm);
                if pulses.len() == 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        let expected: Vec<_> = [70, 71, 72, 70, 71].into_iter().map(Some).collect();
        assert_eq!(expected, pulses);
        assert_eq!(5, record.len());
        let greeting = [Command::Hello1, Command::Hello2, Command::Hello3, Command::GetLiveData];
        assert_eq!(greeting.repeat(2), *written.lock().unwrap());
    }

    #[test]
    fn silent_feed_gives_up_after_max_restarts() {
        let transport = ScriptedTransport::new().reply(Command::Hello1, HELLO_REPLY);
        let written = transport.written();
        let mut oxi = device(transport);
        let config = LiveConfig {
            max_restarts: 2,
            ..every_sample()
        };

        let result = oxi.live(&config, |_, _| ControlFlow::Continue(()));
        assert_matches!(result, Err(DriverError::ConnectionLost { restarts: 2 }));
        let live_requests = written
            .lock()
            .unwrap()
            .iter()
            .filter(|&&c| c == Command::GetLiveData)
            .count();
        assert_eq!(3, live_requests);
    }

    #[test]
    fn unanswered_initial_handshake_fails() {
        let mut oxi = device(ScriptedTransport::new());
        assert_matches!(
            oxi.live(&LiveConfig::default(), |_, _| ControlFlow::Continue(())),
            Err(DriverError::Transport(TransportError::Timeout(_)))
        );
    }

    #[test]
    fn record_interval_thins_recorded_points() {
        let mut oxi = device(live_device(&[group(true, 70, 97), group(true, 71, 97), group(true, 72, 97)]));
        let config = LiveConfig {
            record_interval: Duration::from_secs(3600),
            ..LiveConfig::default()
        };
        let mut readings = 0;
        let record = oxi
            .live(&config, |_, _| {
                readings += 1;
                if readings == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(3, readings);
        assert_eq!(1, record.len());
        assert_eq!(70, record.entries()[0].pulse_bpm);
    }

    #[test]
    fn finger_out_points_are_recorded_as_zero() {
        let mut groups = vec![group(true, 70, 97)];
        groups.extend(std::iter::repeat(group(false, 0, 0)).take(11));
        let mut oxi = device(live_device(&groups));
        let config = LiveConfig {
            finger_out_threshold: 10,
            ..every_sample()
        };

        let mut last = None;
        let record = oxi
            .live(&config, |reading, record| {
                last = Some(reading.status);
                if record.len() == 12 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        assert_eq!(Some(LiveStatus::FingerOut), last);
        let pulses: Vec<u8> = record.entries().iter().map(|e| e.pulse_bpm).collect();
        let mut expected = vec![70; 11];
        expected.push(0);
        assert_eq!(expected, pulses);
    }
}
