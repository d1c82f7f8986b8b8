//! CMS50EW device driver.
//!
//! This module holds the device handle: it owns the transport and issues
//! commands from the catalog, decodes the replies, and feeds the sample stream
//! to the parser.
//!
//! # Protocol notes
//!
//! - Commands are fixed 9-byte frames; a reply is everything that arrives
//!   until a read times out (100 ms on serial, 1 s over Bluetooth).
//! - The device must be greeted with the hello sequence before it answers
//!   anything else, and again after the live stream stalls.
//! - Only one command may be in flight. Live capture and session download
//!   both stream until the link goes quiet; an interrupted download leaves
//!   bytes in flight and the link must be reopened with [`Cms50ew::reopen`].

use std::ops::ControlFlow;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bluetooth::BluetoothConnector;
use crate::commands::Command;
use crate::decode::{decode_session_count, decode_session_duration, decode_text};
use crate::download::{DownloadProgress, SessionDownloader};
use crate::errors::{DriverError, ParseError, Result, TransportError};
use crate::live::{LiveCapture, LiveConfig, LiveReading};
use crate::parser::{Sample, SampleParser};
use crate::session::{SessionMetadata, SessionRecord};
use crate::transport::{LinkConfig, SerialTransport, Target, Transport};

/// Reads per reply before we assume the device is streaming rather than answering.
const MAX_REPLY_CHUNKS: usize = 256;

const READ_CHUNK: usize = 64;

/// CMS50EW pulse oximeter handle.
///
/// # Example
/// ```ignore
/// let mut oxi = Cms50ew::connect_serial("/dev/ttyUSB0")?;
/// oxi.initiate()?;
/// println!("{} {}", oxi.vendor()?, oxi.model()?);
///
/// let (meta, record) = oxi.download_session(|p| {
///     println!("{}/{}", p.downloaded, p.expected);
///     ControlFlow::Continue(())
/// })?;
/// println!("{} of {} points", record.len(), meta.expected_point_count);
/// ```
pub struct Cms50ew {
    transport: Box<dyn Transport>,
    read_timeout: Duration,
    parser: SampleParser,
    target: Option<Target>,
    config: LinkConfig,
}

impl Cms50ew {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the link to `target`.
    pub fn open(target: Target, config: &LinkConfig) -> Result<Self> {
        let transport = open_transport(&target, config)?;
        info!("connected to oximeter: {}", target);
        Ok(Self {
            transport,
            read_timeout: config.read_timeout_for(&target),
            parser: SampleParser::new(),
            target: Some(target),
            config: config.clone(),
        })
    }

    /// Open a USB serial adapter, e.g. `/dev/ttyUSB0`.
    pub fn connect_serial(path: &str) -> Result<Self> {
        Self::open(Target::Serial(path.to_string()), &LinkConfig::default())
    }

    /// Open an RFCOMM link to an oximeter by MAC address.
    pub fn connect_bluetooth(mac: &str) -> Result<Self> {
        Self::open(Target::Bluetooth(mac.to_string()), &LinkConfig::default())
    }

    /// Wrap an already open transport. Such a handle cannot [`reopen`](Self::reopen).
    pub fn from_transport(transport: Box<dyn Transport>, read_timeout: Duration) -> Self {
        Self {
            transport,
            read_timeout,
            parser: SampleParser::new(),
            target: None,
            config: LinkConfig::default(),
        }
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    // ------------------------------------------------------------------------
    // Raw command I/O
    // ------------------------------------------------------------------------

    /// Write one command frame.
    pub fn send(&mut self, cmd: Command) -> Result<()> {
        debug!("sending command: {}", cmd);
        self.transport.write_all(&cmd.frame())?;
        Ok(())
    }

    /// Collect a reply: everything that arrives until a read times out.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..MAX_REPLY_CHUNKS {
            let n = self.transport.read_timeout(&mut chunk, self.read_timeout)?;
            if n == 0 {
                return Ok(reply);
            }
            reply.extend_from_slice(&chunk[..n]);
        }
        warn!(
            "reply did not end after {} bytes, device is probably streaming",
            reply.len()
        );
        Ok(reply)
    }

    /// Send `cmd` and collect its reply.
    pub fn query(&mut self, cmd: Command) -> Result<Vec<u8>> {
        self.send(cmd)?;
        let reply = self.recv()?;
        debug!("reply to {}: {:02X?}", cmd, reply);
        Ok(reply)
    }

    // ------------------------------------------------------------------------
    // Device commands
    // ------------------------------------------------------------------------

    /// Greet the device. Required before any other command.
    ///
    /// Fails with [`TransportError::Timeout`] when the first hello goes unanswered.
    pub fn initiate(&mut self) -> Result<()> {
        if self.query(Command::Hello1)?.is_empty() {
            return Err(TransportError::Timeout("no reply to handshake".into()).into());
        }
        self.send(Command::Hello2)?;
        self.send(Command::Hello3)?;
        self.recv()?;
        self.parser.reset();
        debug!("handshake complete");
        Ok(())
    }

    pub fn vendor(&mut self) -> Result<String> {
        Ok(decode_text(&self.query(Command::GetVendor)?))
    }

    pub fn model(&mut self) -> Result<String> {
        Ok(decode_text(&self.query(Command::GetModel)?))
    }

    /// Name of the user profile the session was recorded under.
    pub fn user(&mut self) -> Result<String> {
        Ok(decode_text(&self.query(Command::GetUserInfo)?))
    }

    /// Whether a recorded session is stored. A short reply counts as "no".
    pub fn session_available(&mut self) -> Result<bool> {
        let reply = self.query(Command::GetSessionCount)?;
        match decode_session_count(&reply) {
            Ok(available) => Ok(available),
            Err(e) => {
                warn!("treating session count as unavailable: {}", e);
                Ok(false)
            }
        }
    }

    /// Length of the stored session.
    pub fn session_duration(&mut self) -> Result<Duration> {
        let reply = self.query(Command::GetSessionDuration)?;
        Ok(decode_session_duration(&reply)?)
    }

    /// Availability, duration and expected point count of the stored session.
    pub fn session_metadata(&mut self) -> Result<SessionMetadata> {
        if !self.session_available()? {
            return Ok(SessionMetadata::unavailable());
        }
        let meta = SessionMetadata::from_duration(self.session_duration()?);
        debug!(
            "stored session: duration={:?}, expected_points={}",
            meta.duration, meta.expected_point_count
        );
        Ok(meta)
    }

    /// Ask the device to erase its stored session.
    ///
    /// The device does not acknowledge this and not every firmware honours it;
    /// check [`session_available`](Self::session_available) afterwards.
    pub fn erase_session(&mut self) -> Result<()> {
        self.send(Command::SessionErase)?;
        info!("sent session erase command");
        Ok(())
    }

    /// Greet the device and switch it to live streaming.
    pub fn start_live(&mut self) -> Result<()> {
        self.initiate()?;
        self.send(Command::GetLiveData)
    }

    /// Scan the stream for the next sample.
    pub fn read_sample(&mut self) -> std::result::Result<Sample, ParseError> {
        self.parser
            .read_sample(self.transport.as_mut(), self.read_timeout)
    }

    // ------------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------------

    /// Download the stored session.
    ///
    /// `on_progress` runs after every point; returning `Break` cancels the
    /// download. The points received so far are returned either way, but after
    /// a cancel the link must be [reopened](Self::reopen) before further use.
    pub fn download_session<F>(&mut self, mut on_progress: F) -> Result<(SessionMetadata, SessionRecord)>
    where
        F: FnMut(DownloadProgress) -> ControlFlow<()>,
    {
        self.initiate()?;
        let meta = self.session_metadata()?;
        if !meta.available {
            return Err(DriverError::NoSession);
        }

        let mut downloader = SessionDownloader::new();
        downloader.start(self, meta.expected_point_count)?;
        while downloader.step(self)? {
            if on_progress(downloader.progress()).is_break() {
                warn!(
                    "download cancelled after {} of {} points",
                    downloader.record().len(),
                    meta.expected_point_count
                );
                break;
            }
        }

        info!(
            "downloaded {} of {} expected points",
            downloader.record().len(),
            meta.expected_point_count
        );
        Ok((meta, downloader.into_record()))
    }

    /// Stream live readings until `on_reading` returns `Break`.
    ///
    /// See [`LiveCapture`] for restart and recording behaviour.
    pub fn live<F>(&mut self, config: &LiveConfig, on_reading: F) -> Result<SessionRecord>
    where
        F: FnMut(&LiveReading, &SessionRecord) -> ControlFlow<()>,
    {
        LiveCapture::new(config.clone()).run(self, on_reading)
    }

    // ------------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------------

    /// Close and reopen the same target, then greet the device again.
    pub fn reopen(&mut self) -> Result<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| DriverError::NotReady("handle was not opened from a target".into()))?;

        if let Err(e) = self.transport.close() {
            warn!("error closing link before reopen: {}", e);
        }
        self.transport = open_transport(&target, &self.config)?;
        self.parser.reset();
        info!("reopened link: {}", target);
        self.initiate()
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        Ok(())
    }
}

fn open_transport(target: &Target, config: &LinkConfig) -> Result<Box<dyn Transport>> {
    Ok(match target {
        Target::Serial(path) => Box::new(SerialTransport::open(path, config)?),
        Target::Bluetooth(mac) => Box::new(BluetoothConnector::from_config(config).connect(mac)?),
    })
}
