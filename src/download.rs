//! Bulk download of the session stored on the device.
//!
//! After get-session-data the device replays its stored points as the same
//! 8-byte groups the live feed uses, one per 3 seconds of recording, and then
//! goes quiet. The quiet link is the only end-of-session signal.

use log::{debug, info};

use crate::cms50ew::Cms50ew;
use crate::commands::Command;
use crate::errors::{DriverError, ParseError, Result};
use crate::session::{SessionRecord, DEVICE_SAMPLE_INTERVAL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Downloading,
    Finished,
}

/// Points received against points announced by the session metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: usize,
    pub expected: usize,
}

impl DownloadProgress {
    /// Completion in `0.0..=1.0`. Devices sometimes deliver more points than announced.
    pub fn fraction(&self) -> f64 {
        if self.expected == 0 {
            return 1.0;
        }
        (self.downloaded as f64 / self.expected as f64).min(1.0)
    }
}

/// Step-wise downloader, so the caller keeps control between points.
#[derive(Debug)]
pub struct SessionDownloader {
    state: DownloadState,
    elapsed_secs: u32,
    expected: usize,
    record: SessionRecord,
}

impl Default for SessionDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDownloader {
    pub fn new() -> Self {
        Self {
            state: DownloadState::Idle,
            elapsed_secs: 0,
            expected: 0,
            record: SessionRecord::new(),
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Timestamp the next point will receive.
    pub fn elapsed_secs(&self) -> u32 {
        self.elapsed_secs
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn into_record(self) -> SessionRecord {
        self.record
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            downloaded: self.record.len(),
            expected: self.expected,
        }
    }

    /// Request the stored session and start a fresh record.
    pub fn start(&mut self, device: &mut Cms50ew, expected_point_count: usize) -> Result<()> {
        if self.state == DownloadState::Downloading {
            return Err(DriverError::NotReady("download already in progress".into()));
        }
        self.record.clear();
        self.elapsed_secs = 0;
        self.expected = expected_point_count;
        device.send(Command::GetSessionData)?;
        self.state = DownloadState::Downloading;
        debug!("session download started: expected_points={}", expected_point_count);
        Ok(())
    }

    /// Fetch one point. Returns `false` once the device has nothing left.
    ///
    /// The end of the stream is the normal way a download finishes; it resets
    /// the timestamp counter and moves to [`DownloadState::Finished`].
    pub fn step(&mut self, device: &mut Cms50ew) -> Result<bool> {
        match self.state {
            DownloadState::Idle => Err(DriverError::NotReady("download not started".into())),
            DownloadState::Finished => Ok(false),
            DownloadState::Downloading => match device.read_sample() {
                Ok(sample) => {
                    self.record.push(f64::from(self.elapsed_secs), sample);
                    self.elapsed_secs += DEVICE_SAMPLE_INTERVAL_SECS;
                    Ok(true)
                }
                Err(ParseError::StreamEnded) => {
                    self.elapsed_secs = 0;
                    self.state = DownloadState::Finished;
                    info!(
                        "session download finished: {} of {} points",
                        self.record.len(),
                        self.expected
                    );
                    Ok(false)
                }
                Err(ParseError::Transport(e)) => Err(e.into()),
            },
        }
    }

    /// Back to idle. Points downloaded so far stay readable.
    pub fn reset(&mut self) {
        self.state = DownloadState::Idle;
        self.elapsed_secs = 0;
    }
}
