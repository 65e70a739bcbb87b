//! Serial line transport.
//!
//! Owns the OS serial device for a session: opens it at a requested baud
//! rate, runs a reader thread that reassembles newline-delimited frames, and
//! accepts raw byte writes. Framing of *outgoing* data is the caller's
//! responsibility; the transport adds nothing.
//!
//! The [`Transport`] trait is the seam between the session and the device so
//! tests can substitute a [`VirtualTransport`] that records writes and is fed
//! lines by hand.

use grblhub_core::{Result, TransportError};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Read timeout for the reader thread; bounds close() latency.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The device was opened successfully.
    Opened,
    /// One complete line, trailing newline (and carriage return) stripped.
    Line(String),
    /// The device was closed.
    Closed,
    /// The device failed; the transport is dead.
    Error(String),
}

/// Byte-level interface to an open device
pub trait Transport: Send {
    /// Transmit raw bytes; no framing is added.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Close the device. The reader emits [`TransportEvent::Closed`].
    fn close(&mut self);

    /// The device name this transport is bound to.
    fn port_name(&self) -> &str;
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
}

/// List available serial ports on the system
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .map(|port| {
                let manufacturer = match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb_info) => {
                        usb_info.manufacturer.clone()
                    }
                    _ => None,
                };
                SerialPortInfo {
                    port_name: port.port_name.clone(),
                    manufacturer,
                }
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(TransportError::EnumerationFailed {
                reason: e.to_string(),
            }
            .into())
        }
    }
}

/// Real serial transport backed by the serialport crate
pub struct SerialTransport {
    port: String,
    writer: Option<Box<dyn serialport::SerialPort>>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open a serial device and spawn its reader thread.
    ///
    /// Returns the transport (write half) and the event receiver. The reader
    /// emits [`TransportEvent::Opened`] first, then one
    /// [`TransportEvent::Line`] per received frame, and finally `Closed` or
    /// `Error` when the device goes away.
    pub fn open(port: &str, baud: u32) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let writer = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", port, e);
                TransportError::OpenFailed {
                    port: port.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let reader = writer.try_clone().map_err(|e| TransportError::OpenFailed {
            port: port.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_port = port.to_string();
        let thread_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name(format!("serial-read-{}", port))
            .spawn(move || read_loop(thread_port, reader, tx, thread_shutdown))
            .map_err(|e| TransportError::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        Ok((
            Self {
                port: port.to_string(),
                writer: Some(writer),
                shutdown,
            },
            rx,
        ))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| TransportError::NotOpen {
            port: self.port.clone(),
        })?;

        let result = writer.write_all(data).and_then(|_| writer.flush());
        result.map_err(|e| {
            TransportError::WriteFailed {
                port: self.port.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.writer = None;
    }

    fn port_name(&self) -> &str {
        &self.port
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Reader thread body: reassemble newline-delimited frames.
fn read_loop(
    port: String,
    mut reader: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
) {
    if tx.blocking_send(TransportEvent::Opened).is_err() {
        return;
    }

    let mut pending = Vec::new();
    let mut buf = [0u8; 512];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            let _ = tx.blocking_send(TransportEvent::Closed);
            return;
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                tracing::debug!("Serial port {} reached EOF", port);
                let _ = tx.blocking_send(TransportEvent::Closed);
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let frame: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&frame)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.blocking_send(TransportEvent::Line(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    let _ = tx.blocking_send(TransportEvent::Closed);
                } else {
                    tracing::warn!("Serial port {} read failed: {}", port, e);
                    let _ = tx.blocking_send(TransportEvent::Error(e.to_string()));
                }
                return;
            }
        }
    }
}

/// In-memory transport for tests.
///
/// Records every write and lets the test feed [`TransportEvent`]s through
/// the returned sender, standing in for the device end of the link.
pub struct VirtualTransport {
    port: String,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: mpsc::Sender<TransportEvent>,
    closed: bool,
}

impl VirtualTransport {
    /// Create a virtual transport.
    ///
    /// Returns the transport, a sender for injecting events (the "device"),
    /// and the receiver the session consumes.
    pub fn new(
        port: impl Into<String>,
    ) -> (
        Self,
        mpsc::Sender<TransportEvent>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Self {
            port: port.into(),
            writes: Arc::new(Mutex::new(Vec::new())),
            events: tx.clone(),
            closed: false,
        };
        (transport, tx, rx)
    }

    /// Handle to the recorded writes.
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.writes.clone()
    }
}

impl Transport for VirtualTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransportError::NotOpen {
                port: self.port.clone(),
            }
            .into());
        }
        self.writes
            .lock()
            .expect("virtual transport write log poisoned")
            .push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.try_send(TransportEvent::Closed);
        }
    }

    fn port_name(&self) -> &str {
        &self.port
    }
}
