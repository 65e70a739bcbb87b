//! # grblhub Communication
//!
//! The serial side of the bridge: the line transport over the OS serial
//! device, the Grbl reply classifier, and the flow-controlled command queue.

pub mod protocol;
pub mod queue;
pub mod transport;

pub use protocol::{classify, GrblLine, MachineState, StatusReport};
pub use queue::{CommandQueue, RunState};
pub use transport::{
    list_ports, SerialPortInfo, SerialTransport, Transport, TransportEvent, VirtualTransport,
};
