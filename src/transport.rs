//! Byte channels the driver can talk through.
//!
//! The CMS50EW is reachable either through a USB serial adapter or over
//! Bluetooth RFCOMM. Both are exposed through the same [`Transport`] trait so
//! the protocol code never branches on the link kind.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::TransportError;

/// Serial baud rate of the CMS50EW.
const BAUD_RATE: u32 = 115200;

/// Per-byte read timeout on the wired link.
const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-byte read timeout on the wireless link.
const BLUETOOTH_TIMEOUT: Duration = Duration::from_secs(1);

const RFCOMM_CHANNEL: u8 = 1;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Minimal capability the protocol driver needs from a link.
///
/// `read_timeout` returning `Ok(0)` means nothing arrived in time. That is a
/// normal condition (it is how replies and the sample stream end), never an
/// error.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the first one.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Where the device lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    Serial(String),
    /// Bluetooth MAC address, e.g. `00:1C:05:AB:CD:EF`.
    Bluetooth(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Serial(path) => write!(f, "serial:{path}"),
            Target::Bluetooth(mac) => write!(f, "bluetooth:{mac}"),
        }
    }
}

/// Link-level settings shared by both transports.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub serial_timeout: Duration,
    pub bluetooth_timeout: Duration,
    pub rfcomm_channel: u8,
    pub connect_retries: u32,
    pub retry_delay: Duration,
    /// PIN offered when BlueZ asks for one while pairing.
    pub pin: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            serial_timeout: SERIAL_TIMEOUT,
            bluetooth_timeout: BLUETOOTH_TIMEOUT,
            rfcomm_channel: RFCOMM_CHANNEL,
            connect_retries: MAX_CONNECT_RETRIES,
            retry_delay: RETRY_DELAY,
            pin: None,
        }
    }
}

impl LinkConfig {
    /// Read timeout appropriate for the given target.
    pub fn read_timeout_for(&self, target: &Target) -> Duration {
        match target {
            Target::Serial(_) => self.serial_timeout,
            Target::Bluetooth(_) => self.bluetooth_timeout,
        }
    }
}

/// Map the "nothing arrived" flavours of `io::Error` onto an empty read.
pub(crate) fn read_or_empty(res: std::io::Result<usize>) -> Result<usize, TransportError> {
    match res {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Serial
// ============================================================================

/// USB serial link.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialTransport {
    /// Open `path` with the framing the device expects (8N1, XON/XOFF).
    pub fn open(path: &str, config: &LinkConfig) -> Result<Self, TransportError> {
        let port = serialport::new(path, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Software)
            .timeout(config.serial_timeout)
            .open()?;
        debug!("opened serial port: path={}, baud={}", path, config.baud_rate);

        Ok(Self {
            port: Some(port),
            timeout: config.serial_timeout,
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        if timeout != self.timeout {
            self.port()?.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        let res = self.port()?.read(buf);
        read_or_empty(res)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!("closed serial port");
        }
        Ok(())
    }
}

// ============================================================================
// In-memory transport for tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::io;

    #[test]
    fn timeouts_read_as_empty() {
        let timed_out = io::Error::new(ErrorKind::TimedOut, "t");
        let would_block = io::Error::new(ErrorKind::WouldBlock, "w");
        assert_eq!(0, read_or_empty(Err(timed_out)).unwrap());
        assert_eq!(0, read_or_empty(Err(would_block)).unwrap());
        assert_eq!(3, read_or_empty(Ok(3)).unwrap());
    }

    #[test]
    fn other_io_errors_are_transport_failures() {
        let reset = io::Error::new(ErrorKind::ConnectionReset, "gone");
        assert_matches!(read_or_empty(Err(reset)), Err(TransportError::Io(_)));
    }

    #[test]
    fn default_timeouts_follow_link_kind() {
        let config = LinkConfig::default();
        assert_eq!(
            Duration::from_millis(100),
            config.read_timeout_for(&Target::Serial("/dev/ttyUSB0".into()))
        );
        assert_eq!(
            Duration::from_secs(1),
            config.read_timeout_for(&Target::Bluetooth("00:11:22:33:44:55".into()))
        );
    }
}
