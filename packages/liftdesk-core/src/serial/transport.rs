//! Transport seam between the protocol and the physical link
//!
//! A `Connector` opens a `SerialLink`; the link hands out its read half and
//! write half exactly once each and owns the underlying connection.

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// How a failed read should be handled by the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// Worth retrying after a short wait
    Transient,
    /// The device or port is gone; the session must be torn down
    DeviceLost,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No compatible serial device was found. Plug in the actuator or pass --port.")]
    NoDeviceSelected,
    #[error("Failed to open serial port {port}: {message}")]
    Open { port: String, message: String },
    #[error("Failed to write to serial port: {0}")]
    Write(String),
    #[error("Failed to read from serial port: {message}")]
    Read { kind: ReadErrorKind, message: String },
    #[error("Serial port is not open")]
    NotOpen,
    #[error("Failed to list serial ports: {0}")]
    Enumerate(String),
}

impl TransportError {
    /// Build a read error, classifying it from the io error.
    pub fn from_read_io(err: &io::Error) -> Self {
        TransportError::Read {
            kind: classify_io_error(err),
            message: err.to_string(),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            TransportError::Read {
                kind: ReadErrorKind::DeviceLost,
                ..
            }
        )
    }
}

/// Messages that mean the device went away, whatever the error kind says.
const DEVICE_LOST_MARKERS: &[&str] = &[
    "device has been lost",
    "device is no longer accessible",
    "port is closed",
    "connection was closed",
    "no such device",
    "device not configured",
];

pub fn classify_io_error(err: &io::Error) -> ReadErrorKind {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied => ReadErrorKind::DeviceLost,
        _ => classify_message(&err.to_string()),
    }
}

pub fn classify_message(message: &str) -> ReadErrorKind {
    let lower = message.to_ascii_lowercase();
    if DEVICE_LOST_MARKERS.iter().any(|m| lower.contains(m)) {
        ReadErrorKind::DeviceLost
    } else {
        ReadErrorKind::Transient
    }
}

/// Opens links to one device.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name of the device for logs and status lines
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Box<dyn SerialLink>, TransportError>;
}

/// An open connection that owns the physical port.
#[async_trait]
pub trait SerialLink: Send {
    /// Returns `None` once the reader has been taken.
    fn take_reader(&mut self) -> Option<Box<dyn LinkReader>>;

    /// Returns `None` once the writer has been taken.
    fn take_writer(&mut self) -> Option<Box<dyn LinkWriter>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait LinkReader: Send {
    /// Wait for the next chunk. `Ok(None)` means end of stream.
    ///
    /// Must be cancel-safe: dropping the future may not lose data.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Unblock any pending read and stop the underlying reader.
    async fn cancel(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
