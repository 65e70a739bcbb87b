//! # grblhub Core
//!
//! Core types for the grblhub bridge: error taxonomy, wire event
//! definitions, g-code program ingestion, and configuration.

pub mod config;
pub mod error;
pub mod events;
pub mod gcode;

pub use config::{BridgeConfig, CncSettings, TimingSettings};
pub use error::{ConfigError, Error, GcodeError, Result, RoutingError, TransportError};
pub use events::{
    ClientId, ClientRequest, Coordinates, CurrentStatus, PortClosed, PortDescriptor, PortError,
    PortOpened, QueueStatus, ServerEvent,
};
pub use gcode::parse_program;
