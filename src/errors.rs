use std::io;
use thiserror::Error;

/// Failures of the byte channel itself (serial port or RFCOMM socket).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport closed")]
    Closed,
}

#[cfg_attr(not(feature = "bluez"), allow(dead_code))]
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    NotFound { mac: String },
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),
}

/// A device reply was too short for the field being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("response truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
}

/// Outcome of the sample scanner when it cannot produce a sample.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The transport yielded no byte within the read timeout.
    #[error("sample stream ended")]
    StreamEnded,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("no stored session available on the device")]
    NoSession,
    #[error("live stream lost after {restarts} restart attempts")]
    ConnectionLost { restarts: u32 },
}

impl From<BluetoothError> for DriverError {
    fn from(e: BluetoothError) -> Self {
        DriverError::Transport(TransportError::Bluetooth(e))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
