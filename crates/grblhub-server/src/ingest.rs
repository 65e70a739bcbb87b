//! G-code upload hook.
//!
//! Consumes `file:upload` messages: parses the program text into stripped
//! lines and refills the target session's queue. A failed parse drops the
//! upload without touching the queue.

use crate::registry::Registry;
use crate::session::SessionRequest;
use grblhub_core::{parse_program, Result, RoutingError};
use serde::Deserialize;

/// Metadata accompanying an upload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadMeta {
    /// Target port device name.
    pub port: String,
    /// Original file name, informational.
    pub name: String,
}

/// Payload of the `file:upload` topic
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Upload {
    /// Routing metadata.
    pub meta: UploadMeta,
    /// Raw program text.
    pub contents: String,
}

/// Load an uploaded program into the queue of the session holding its port.
///
/// Stops and clears the queue before refilling it; a running program is
/// abandoned. Fails with `NoSuchPort` when no session holds the port and
/// with a parse error when the text is rejected — in both cases nothing is
/// modified.
pub async fn ingest(registry: &Registry, upload: Upload) -> Result<()> {
    let lines = match parse_program(&upload.contents) {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!("Dropping upload {}: {}", upload.meta.name, e);
            return Err(e);
        }
    };

    let Some(session) = registry.session(&upload.meta.port) else {
        tracing::warn!(
            "Dropping upload {}: no session for port {}",
            upload.meta.name,
            upload.meta.port
        );
        return Err(RoutingError::NoSuchPort {
            port: upload.meta.port,
        }
        .into());
    };

    tracing::info!(
        "Ingesting {} ({} command(s)) for {}",
        upload.meta.name,
        lines.len(),
        upload.meta.port
    );

    session
        .request(SessionRequest::LoadProgram {
            text: upload.contents,
            lines,
        })
        .await;

    Ok(())
}
