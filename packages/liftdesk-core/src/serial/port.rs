//! Serial port transport backed by the `serialport` crate
//!
//! `serialport` is blocking, so reads happen on a dedicated thread that
//! forwards chunks over a channel, and writes go through `spawn_blocking`
//! on a cloned handle.

use super::transport::{Connector, LinkReader, LinkWriter, SerialLink, TransportError};
use crate::DEFAULT_BAUD_RATE;
use async_trait::async_trait;
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a blocking read waits before checking the stop flag.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const READ_BUFFER_SIZE: usize = 1024;
const READ_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    /// `usb`, `pci`, `bluetooth` or `unknown`
    pub kind: String,
    pub description: Option<String>,
}

impl PortInfo {
    fn from_serialport(info: serialport::SerialPortInfo) -> Self {
        let (kind, description) = match info.port_type {
            SerialPortType::UsbPort(usb) => (
                "usb",
                Some(usb_description(
                    usb.product.or(usb.manufacturer),
                    usb.vid,
                    usb.pid,
                )),
            ),
            SerialPortType::PciPort => ("pci", None),
            SerialPortType::BluetoothPort => ("bluetooth", None),
            SerialPortType::Unknown => ("unknown", None),
        };
        Self {
            name: info.port_name,
            kind: kind.to_string(),
            description,
        }
    }

    pub fn is_usb(&self) -> bool {
        self.kind == "usb"
    }
}

fn usb_description(product: Option<String>, vid: u16, pid: u16) -> String {
    let product = product.unwrap_or_else(|| "USB device".to_string());
    format!("{} ({:04x}:{:04x})", product, vid, pid)
}

/// List serial ports on this machine.
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::Enumerate(e.to_string()))?;
    Ok(ports.into_iter().map(PortInfo::from_serialport).collect())
}

/// Opens a real serial port at 8N1, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    /// `None` picks the first USB serial port
    pub port_name: Option<String>,
    pub baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port_name: Option<String>) -> Self {
        Self {
            port_name,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    fn resolve_port(&self) -> Result<String, TransportError> {
        if let Some(name) = &self.port_name {
            return Ok(name.clone());
        }
        list_ports()?
            .into_iter()
            .find(PortInfo::is_usb)
            .map(|port| port.name)
            .ok_or(TransportError::NoDeviceSelected)
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn describe(&self) -> String {
        match &self.port_name {
            Some(name) => format!("{} @ {}", name, self.baud_rate),
            None => format!("first USB port @ {}", self.baud_rate),
        }
    }

    async fn open(&self) -> Result<Box<dyn SerialLink>, TransportError> {
        let name = self.resolve_port()?;
        let baud_rate = self.baud_rate;
        log::debug!("[serial] opening {} at {} baud", name, baud_rate);

        let open_err = {
            let name = name.clone();
            move |message: String| TransportError::Open {
                port: name.clone(),
                message,
            }
        };

        let builder = serialport::new(name.clone(), baud_rate)
            .timeout(READ_POLL_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| open_err(e.to_string()))?
            .map_err(|e| open_err(e.to_string()))?;

        let reader_port = port.try_clone().map_err(|e| open_err(e.to_string()))?;
        let writer_port = port.try_clone().map_err(|e| open_err(e.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = ThreadReader::spawn(&name, reader_port, Arc::clone(&stop))
            .map_err(|e| open_err(e.to_string()))?;

        Ok(Box::new(SerialPortLink {
            name,
            port: Some(port),
            stop,
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(BlockingWriter {
                port: Arc::new(Mutex::new(writer_port)),
            })),
        }))
    }
}

struct SerialPortLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    stop: Arc<AtomicBool>,
    reader: Option<Box<dyn LinkReader>>,
    writer: Option<Box<dyn LinkWriter>>,
}

#[async_trait]
impl SerialLink for SerialPortLink {
    fn take_reader(&mut self) -> Option<Box<dyn LinkReader>> {
        self.reader.take()
    }

    fn take_writer(&mut self) -> Option<Box<dyn LinkWriter>> {
        self.writer.take()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::Release);
        self.reader = None;
        self.writer = None;
        // The OS handle is released when the last clone drops
        if self.port.take().is_some() {
            log::debug!("[serial] released {}", self.name);
        }
        Ok(())
    }
}

type ReadItem = Result<Option<Vec<u8>>, TransportError>;

/// Reads on a dedicated thread; chunks arrive over a channel.
struct ThreadReader {
    rx: mpsc::Receiver<ReadItem>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ThreadReader {
    fn spawn(
        name: &str,
        mut port: Box<dyn SerialPort>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name("liftdesk-serial-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                while !thread_stop.load(Ordering::Acquire) {
                    match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if tx.blocking_send(Ok(Some(buf[..n].to_vec()))).is_err() {
                                break;
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::Interrupted
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            let err = TransportError::from_read_io(&e);
                            let lost = err.is_device_lost();
                            if tx.blocking_send(Err(err)).is_err() || lost {
                                break;
                            }
                            std::thread::sleep(READ_POLL_TIMEOUT);
                        }
                    }
                }
                log::debug!("[serial] reader thread for {} exiting", thread_name);
            })?;

        Ok(Self {
            rx,
            stop,
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl LinkReader for ThreadReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::Release);
        // Unblocks a thread parked in blocking_send
        self.rx.close();

        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        match joined {
            Ok(Ok(())) => Ok(()),
            _ => Err(TransportError::Read {
                kind: super::ReadErrorKind::DeviceLost,
                message: "serial reader thread panicked".to_string(),
            }),
        }
    }
}

struct BlockingWriter {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[async_trait]
impl LinkWriter for BlockingWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = Arc::clone(&self.port);
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut port = port
                .lock()
                .map_err(|_| TransportError::Write("serial port lock poisoned".to_string()))?;
            port.write_all(&bytes)
                .and_then(|_| port.flush())
                .map_err(|e| TransportError::Write(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Write(e.to_string()))?
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let port = Arc::clone(&self.port);
        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut port = port
                .lock()
                .map_err(|_| TransportError::Write("serial port lock poisoned".to_string()))?;
            port.flush().map_err(|e| TransportError::Write(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Write(e.to_string()))?
    }
}
