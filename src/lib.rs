//! Contec CMS50EW pulse oximeter driver.
//!
//! Talks to the device over a USB serial adapter or Bluetooth RFCOMM, reads
//! live pulse and SpO2 readings, and downloads the session the device stored
//! while recording on its own. With the `python` feature the crate also builds
//! the `_core` extension module.
//!
//! # Quick start
//!
//! ```ignore
//! use std::ops::ControlFlow;
//! use cms50ew::{Cms50ew, LiveConfig};
//!
//! let mut oxi = Cms50ew::connect_serial("/dev/ttyUSB0")?;
//! let record = oxi.live(&LiveConfig::default(), |reading, _| {
//!     println!("{:?} {:?} {:?}", reading.status, reading.pulse_bpm, reading.spo2_pct);
//!     ControlFlow::Continue(())
//! })?;
//! ```
//!
//! # Timing
//!
//! Stored sessions carry no timestamps. Points are exactly 3 seconds apart and
//! the first one is at 0 s; [`SessionRecord::rebased`] maps them onto a wall
//! clock start time when the caller knows it. Live points are stamped with
//! the time elapsed since the capture started.

mod bluetooth;
mod cms50ew;
pub mod commands;
pub mod decode;
mod download;
mod errors;
mod live;
pub mod logging;
mod parser;
#[cfg(feature = "python")]
mod python;
mod session;
mod transport;

pub use crate::bluetooth::{BluetoothConnector, RfcommStream};
pub use crate::cms50ew::Cms50ew;
pub use crate::commands::{lookup, Command, UnknownCommand};
pub use crate::download::{DownloadProgress, DownloadState, SessionDownloader};
pub use crate::errors::*;
pub use crate::live::{Debouncer, LiveCapture, LiveConfig, LiveReading, LiveStatus};
pub use crate::parser::{Sample, SampleParser};
pub use crate::session::{
    expected_points, ExportRow, SessionEntry, SessionMetadata, SessionRecord,
    DEVICE_SAMPLE_INTERVAL_SECS, EXPORT_HEADER, EXPORT_HEADER_ABSOLUTE,
};
pub use crate::transport::{LinkConfig, SerialTransport, Target, Transport};
