//! # grblhub Server
//!
//! The control plane of the bridge: per-port Grbl sessions, the process-wide
//! client registry with event fan-out, the upload ingest hook, and the
//! inbound command router.

pub mod ingest;
pub mod registry;
pub mod router;
pub mod session;

pub use ingest::{ingest, Upload, UploadMeta};
pub use registry::{ClientSink, Registry};
pub use router::Router;
pub use session::{ClientBinding, ConnectionState, Session, SessionRequest};
