//! # grblhub
//!
//! A bridge and control plane between remote clients and CNC controllers
//! speaking the Grbl serial protocol. For each attached serial port it keeps
//! an open link, streams G-code line-by-line under Grbl's
//! one-outstanding-command flow control, polls controller status, and fans
//! events out to every attached client.
//!
//! ## Architecture
//!
//! grblhub is organized as a workspace:
//!
//! 1. **grblhub-core** - Errors, wire events, g-code ingestion, configuration
//! 2. **grblhub-communication** - Serial transport, Grbl protocol, command queue
//! 3. **grblhub-server** - Sessions, client registry, ingest hook, router
//! 4. **grblhub** - This crate; re-exports and process setup
//!
//! The client-facing socket layer is a consumer of this library: it decodes
//! frames into [`ClientRequest`] values for the [`Router`] and implements
//! [`ClientSink`] to carry [`ServerEvent`]s back out.

pub use grblhub_core::{
    parse_program, BridgeConfig, ClientId, ClientRequest, Coordinates, CurrentStatus, Error,
    GcodeError, PortClosed, PortDescriptor, PortError, PortOpened, QueueStatus, Result,
    RoutingError, ServerEvent, TimingSettings, TransportError,
};

pub use grblhub_communication::{
    classify, list_ports, CommandQueue, GrblLine, MachineState, SerialPortInfo, SerialTransport,
    StatusReport, Transport, TransportEvent,
};

pub use grblhub_server::{
    ingest, ClientSink, ConnectionState, Registry, Router, Session, SessionRequest, Upload,
    UploadMeta,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with console output, RUST_LOG environment
/// variable support, and an INFO default level.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
