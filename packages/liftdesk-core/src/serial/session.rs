//! One open connection to the device
//!
//! Owns the link and its read/write halves. The halves exist exactly while
//! the session is open; `close` releases all three on every path.

use super::transport::{Connector, LinkReader, LinkWriter, SerialLink, TransportError};
use std::time::Duration;
use tokio::time::Instant;

/// No data for this long while established means the link is dead.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    EndOfStream,
}

pub struct Session {
    link: Option<Box<dyn SerialLink>>,
    reader: Option<Box<dyn LinkReader>>,
    writer: Option<Box<dyn LinkWriter>>,
    device: String,
    last_data_at: Instant,
    stale_after: Duration,
}

impl Session {
    /// Open the device and take both halves of the link.
    pub async fn open(
        connector: &dyn Connector,
        stale_after: Duration,
    ) -> Result<Self, TransportError> {
        let device = connector.describe();
        let mut link = connector.open().await?;

        let reader = link.take_reader();
        let writer = link.take_writer();
        let (reader, writer) = match (reader, writer) {
            (Some(reader), Some(writer)) => (reader, writer),
            (reader, writer) => {
                let mut partial = Session {
                    link: Some(link),
                    reader,
                    writer,
                    device: device.clone(),
                    last_data_at: Instant::now(),
                    stale_after,
                };
                partial.close().await;
                return Err(TransportError::Open {
                    port: device,
                    message: "link did not provide both read and write handles".to_string(),
                });
            }
        };

        log::info!("[serial] opened {}", device);
        Ok(Self {
            link: Some(link),
            reader: Some(reader),
            writer: Some(writer),
            device,
            last_data_at: Instant::now(),
            stale_after,
        })
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some() && self.reader.is_some() && self.writer.is_some()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer.write_all(bytes).await
    }

    /// Wait for the next chunk. Cancel-safe as long as the reader is.
    pub async fn read_chunk(&mut self) -> Result<Chunk, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::NotOpen)?;
        match reader.read_chunk().await? {
            Some(bytes) => {
                self.last_data_at = Instant::now();
                Ok(Chunk::Data(bytes))
            }
            None => Ok(Chunk::EndOfStream),
        }
    }

    /// Count "now" as data received (setup counts as a response).
    pub fn touch(&mut self) {
        self.last_data_at = Instant::now();
    }

    pub fn last_data_at(&self) -> Instant {
        self.last_data_at
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_data_at) > self.stale_after
    }

    /// Release reader, writer and connection. Idempotent; failures are logged.
    pub async fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            if let Err(e) = reader.cancel().await {
                log::warn!("[serial] error cancelling reader on {}: {}", self.device, e);
            }
        }

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                log::warn!("[serial] error closing writer on {}: {}", self.device, e);
            }
        }

        if let Some(mut link) = self.link.take() {
            match link.close().await {
                Ok(()) => log::info!("[serial] closed {}", self.device),
                Err(e) => log::warn!("[serial] error closing {}: {}", self.device, e),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Handles close when their boxes drop; this only flags a missed close().
        if self.is_open() {
            log::debug!("[serial] session for {} dropped while open", self.device);
        }
    }
}
