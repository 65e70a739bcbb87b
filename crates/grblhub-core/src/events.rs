//! Wire event definitions for the client protocol.
//!
//! The bridge talks to clients over a message-oriented socket layer carrying
//! named events with JSON payloads. This module defines both directions:
//! [`ClientRequest`] for inbound commands and [`ServerEvent`] for outbound
//! notifications. The socket layer itself lives outside the core; it only
//! needs `name()` and `payload()` to frame an outbound message, and serde to
//! decode an inbound one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a connected client session.
pub type ClientId = uuid::Uuid;

/// A set of X/Y/Z coordinates as reported by the controller.
///
/// Grbl reports positions as decimal text; the bridge forwards them verbatim
/// rather than round-tripping through floats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    /// X axis value.
    pub x: String,
    /// Y axis value.
    pub y: String,
    /// Z axis value.
    pub z: String,
}

impl Coordinates {
    /// Create a coordinate triple
    pub fn new(x: impl Into<String>, y: impl Into<String>, z: impl Into<String>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            z: z.into(),
        }
    }
}

/// One entry of a `serialport:list` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// OS device name (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// USB manufacturer if the OS reports one.
    pub manufacturer: Option<String>,
    /// Whether a session currently holds this port open.
    pub inuse: bool,
}

/// Payload of `serialport:open`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOpened {
    /// The device name.
    pub port: String,
    /// Baud rate the port was opened at.
    pub baudrate: u32,
    /// Always true once a session holds the port.
    pub inuse: bool,
}

/// Payload of `serialport:close`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortClosed {
    /// The device name.
    pub port: String,
    /// Whether other clients remain attached to the session.
    pub inuse: bool,
}

/// Payload of `serialport:error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortError {
    /// The device name.
    pub port: String,
}

/// Payload of `grbl:current-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStatus {
    /// Machine state (Idle, Run, Hold, Door, Home, Alarm, Check).
    pub active_state: String,
    /// Position in machine coordinates.
    pub machine_pos: Coordinates,
    /// Position in work coordinates.
    pub working_pos: Coordinates,
}

/// Payload of `gcode:queue-status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Number of acknowledged commands.
    pub executed: usize,
    /// Total number of queued commands.
    pub total: usize,
}

/// Outbound event, server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    /// `serialport:list` — enumeration reply.
    PortList(Vec<PortDescriptor>),
    /// `serialport:open` — a port was opened (or is already held).
    PortOpened(PortOpened),
    /// `serialport:close` — a port was closed or released.
    PortClosed(PortClosed),
    /// `serialport:error` — a port failed to open or errored.
    PortError(PortError),
    /// `serialport:data` — a raw reply line routed to its originator.
    SerialData(String),
    /// `grbl:current-status` — parsed status report, broadcast.
    CurrentStatus(CurrentStatus),
    /// `grbl:gcode-modes` — parser state tokens, broadcast.
    GcodeModes(Vec<String>),
    /// `gcode:queue-status` — queue progress, broadcast on change.
    QueueStatus(QueueStatus),
}

impl ServerEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PortList(_) => "serialport:list",
            ServerEvent::PortOpened(_) => "serialport:open",
            ServerEvent::PortClosed(_) => "serialport:close",
            ServerEvent::PortError(_) => "serialport:error",
            ServerEvent::SerialData(_) => "serialport:data",
            ServerEvent::CurrentStatus(_) => "grbl:current-status",
            ServerEvent::GcodeModes(_) => "grbl:gcode-modes",
            ServerEvent::QueueStatus(_) => "gcode:queue-status",
        }
    }

    /// JSON payload of this event
    pub fn payload(&self) -> Value {
        // All payload types serialize infallibly.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Inbound command, client to server
///
/// Decoded from a `{"event": ..., "data": {...}}` frame by the socket layer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    /// Enumerate serial ports.
    #[serde(rename = "list")]
    List,
    /// Open a port (or attach to its existing session).
    #[serde(rename = "open")]
    Open {
        /// The device name.
        port: String,
        /// Requested baud rate.
        baud: u32,
    },
    /// Detach from a port, closing it when no clients remain.
    #[serde(rename = "close")]
    Close {
        /// The device name.
        port: String,
    },
    /// Write raw bytes to the port, tagging the reply routing.
    #[serde(rename = "serialport:write")]
    Write {
        /// The device name.
        port: String,
        /// Raw payload; the client supplies its own newline if one is needed.
        msg: String,
    },
    /// Start or resume streaming the queued program.
    #[serde(rename = "gcode:run")]
    Run {
        /// The device name.
        port: String,
    },
    /// Pause streaming.
    #[serde(rename = "gcode:pause")]
    Pause {
        /// The device name.
        port: String,
    },
    /// Stop streaming and rewind to the start.
    #[serde(rename = "gcode:stop")]
    Stop {
        /// The device name.
        port: String,
    },
    /// Discard the loaded program.
    #[serde(rename = "gcode:unload")]
    Unload {
        /// The device name.
        port: String,
    },
}
