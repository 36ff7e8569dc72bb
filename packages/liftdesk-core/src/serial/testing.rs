//! In-memory device for tests
//!
//! `FakeDevice` is the test's end of the wire: push inbound bytes, inject read
//! errors, inspect what was written and how the link was torn down.

use super::driver::PanelEmitter;
use super::transport::{Connector, LinkReader, LinkWriter, SerialLink, TransportError};
use crate::{ConnectionStatus, PanelEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type ReadItem = Result<Option<Vec<u8>>, TransportError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FakeStats {
    pub opens: usize,
    pub reader_cancels: usize,
    pub writer_closes: usize,
    pub link_closes: usize,
}

#[derive(Default)]
struct FakeState {
    inbound: Option<mpsc::UnboundedSender<ReadItem>>,
    written: Vec<String>,
    stats: FakeStats,
    link_open: bool,
    open_error: Option<TransportError>,
    write_error: Option<TransportError>,
    fail_cancel: bool,
    fail_writer_close: bool,
}

#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            state: Arc::clone(&self.state),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn send(&self, item: ReadItem) {
        self.with(|s| {
            if let Some(tx) = &s.inbound {
                let _ = tx.send(item);
            }
        });
    }

    /// Deliver bytes to the open link's reader.
    pub fn push(&self, bytes: &[u8]) {
        self.send(Ok(Some(bytes.to_vec())));
    }

    pub fn push_error(&self, error: TransportError) {
        self.send(Err(error));
    }

    pub fn end_stream(&self) {
        self.send(Ok(None));
    }

    pub fn written(&self) -> Vec<String> {
        self.with(|s| s.written.clone())
    }

    pub fn clear_written(&self) {
        self.with(|s| s.written.clear());
    }

    pub fn stats(&self) -> FakeStats {
        self.with(|s| s.stats)
    }

    pub fn is_link_open(&self) -> bool {
        self.with(|s| s.link_open)
    }

    pub fn fail_open(&self, error: TransportError) {
        self.with(|s| s.open_error = Some(error));
    }

    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.with(|s| s.write_error = error);
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.with(|s| s.fail_cancel = fail);
    }

    pub fn fail_writer_close(&self, fail: bool) {
        self.with(|s| s.fail_writer_close = fail);
    }
}

pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn describe(&self) -> String {
        "fake0".to_string()
    }

    async fn open(&self) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.open_error.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        state.link_open = true;
        state.stats.opens += 1;

        Ok(Box::new(FakeLink {
            state: Arc::clone(&self.state),
            reader: Some(Box::new(FakeReader {
                rx,
                state: Arc::clone(&self.state),
            })),
            writer: Some(Box::new(FakeWriter {
                state: Arc::clone(&self.state),
            })),
        }))
    }
}

struct FakeLink {
    state: Arc<Mutex<FakeState>>,
    reader: Option<Box<dyn LinkReader>>,
    writer: Option<Box<dyn LinkWriter>>,
}

#[async_trait]
impl SerialLink for FakeLink {
    fn take_reader(&mut self) -> Option<Box<dyn LinkReader>> {
        self.reader.take()
    }

    fn take_writer(&mut self) -> Option<Box<dyn LinkWriter>> {
        self.writer.take()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.link_open = false;
        state.inbound = None;
        state.stats.link_closes += 1;
        Ok(())
    }
}

struct FakeReader {
    rx: mpsc::UnboundedReceiver<ReadItem>,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl LinkReader for FakeReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        let mut state = self.state.lock().unwrap();
        state.stats.reader_cancels += 1;
        if state.fail_cancel {
            return Err(TransportError::Read {
                kind: super::ReadErrorKind::Transient,
                message: "cancel failed".to_string(),
            });
        }
        Ok(())
    }
}

struct FakeWriter {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl LinkWriter for FakeWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.write_error.clone() {
            return Err(err);
        }
        state.written.push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.stats.writer_closes += 1;
        if state.fail_writer_close {
            return Err(TransportError::Write("close failed".to_string()));
        }
        Ok(())
    }
}

/// Emitter that keeps everything it is given.
#[derive(Default)]
pub struct RecordingEmitter {
    statuses: Mutex<Vec<ConnectionStatus>>,
    events: Mutex<Vec<PanelEvent>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingEmitter {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<PanelEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.statuses.lock().unwrap().last().copied()
    }
}

impl PanelEmitter for RecordingEmitter {
    fn emit_status(&self, status: ConnectionStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn emit_event(&self, event: PanelEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn emit_error(&self, error: String) {
        self.errors.lock().unwrap().push(error);
    }
}

/// Let spawned tasks run until they block (paused clock advances 1ms).
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
}
