//! Error handling for grblhub
//!
//! Provides error types for all layers of the bridge:
//! - Transport errors (serial device related)
//! - G-Code errors (program ingestion)
//! - Routing errors (client command dispatch)
//! - Configuration errors
//!
//! All error types use `thiserror`. Grbl `error:` replies are *not* errors at
//! this layer; they are ordinary acknowledgements.

use thiserror::Error;

/// Transport error type
///
/// Represents errors on the serial link between the bridge and a controller.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The serial device could not be opened
    #[error("failed to open port {port}: {reason}")]
    OpenFailed {
        /// The device name that failed to open.
        port: String,
        /// The underlying reason.
        reason: String,
    },

    /// Operation on a port with no live transport
    #[error("port {port} is not open")]
    NotOpen {
        /// The device name.
        port: String,
    },

    /// The transport closed unexpectedly
    #[error("port {port} closed unexpectedly")]
    Closed {
        /// The device name.
        port: String,
    },

    /// A write to an open port failed
    #[error("write to port {port} failed: {reason}")]
    WriteFailed {
        /// The device name.
        port: String,
        /// The underlying reason.
        reason: String,
    },

    /// Port enumeration failed
    #[error("failed to enumerate serial ports: {reason}")]
    EnumerationFailed {
        /// The underlying reason.
        reason: String,
    },
}

/// G-Code ingestion error type
#[derive(Error, Debug, Clone)]
pub enum GcodeError {
    /// A parenthesis comment was opened but never closed
    #[error("unbalanced comment at line {line_number}")]
    UnbalancedComment {
        /// 1-based line number of the offending line.
        line_number: usize,
    },

    /// A parenthesis comment was closed but never opened
    #[error("unexpected comment terminator at line {line_number}")]
    UnexpectedTerminator {
        /// 1-based line number of the offending line.
        line_number: usize,
    },
}

/// Routing error type
///
/// Represents failures to map a client command or upload onto a session.
#[derive(Error, Debug, Clone)]
pub enum RoutingError {
    /// No session exists for the named port
    #[error("no session for port {port}")]
    NoSuchPort {
        /// The device name.
        port: String,
    },
}

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be parsed
    #[error("failed to parse config {path}: {reason}")]
    Parse {
        /// Path of the configuration file.
        path: String,
        /// The underlying parse error text.
        reason: String,
    },
}

/// Main error type for grblhub
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// G-Code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Routing error
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if this is a g-code error
    pub fn is_gcode_error(&self) -> bool {
        matches!(self, Error::Gcode(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
