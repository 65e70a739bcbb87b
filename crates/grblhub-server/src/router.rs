//! Inbound command routing.
//!
//! Maps each [`ClientRequest`] onto registry and session operations. The
//! router holds no session state of its own; everything lives in the
//! registry so any number of socket-layer workers can share one router.

use crate::registry::Registry;
use crate::session::{Session, SessionRequest};
use grblhub_communication::list_ports;
use grblhub_core::{
    BridgeConfig, ClientId, ClientRequest, PortClosed, PortDescriptor, PortOpened, ServerEvent,
};
use std::sync::Arc;

/// Maps inbound client events onto sessions
pub struct Router {
    registry: Arc<Registry>,
    config: BridgeConfig,
}

impl Router {
    /// Create a router over a registry
    pub fn new(registry: Arc<Registry>, config: BridgeConfig) -> Self {
        Self { registry, config }
    }

    /// The registry this router operates on
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one inbound client event.
    ///
    /// Commands that require an open transport are dropped with a warning
    /// when the port has none; no error event goes back to the client.
    pub async fn handle(&self, client: ClientId, request: ClientRequest) {
        match request {
            ClientRequest::List => self.list(client).await,
            ClientRequest::Open { port, baud } => self.open(client, &port, baud).await,
            ClientRequest::Close { port } => self.close(client, &port).await,
            ClientRequest::Write { port, msg } => {
                self.forward(&port, "write", SessionRequest::Write {
                    client,
                    payload: msg,
                })
                .await
            }
            ClientRequest::Run { port } => {
                self.forward(&port, "gcode:run", SessionRequest::Play).await
            }
            ClientRequest::Pause { port } => {
                self.forward(&port, "gcode:pause", SessionRequest::Pause)
                    .await
            }
            ClientRequest::Stop { port } => {
                self.forward(&port, "gcode:stop", SessionRequest::Stop).await
            }
            ClientRequest::Unload { port } => {
                self.forward(&port, "gcode:unload", SessionRequest::Unload)
                    .await
            }
        }
    }

    /// Enumerate OS ports, union the configured extras, annotate `inuse`.
    async fn list(&self, client: ClientId) {
        let mut descriptors: Vec<PortDescriptor> = Vec::new();

        match list_ports() {
            Ok(ports) => {
                for info in ports {
                    let inuse = self.in_use(&info.port_name);
                    descriptors.push(PortDescriptor {
                        port: info.port_name,
                        manufacturer: info.manufacturer,
                        inuse,
                    });
                }
            }
            Err(e) => {
                // Still advertise the configured extras.
                tracing::warn!("Port enumeration failed: {}", e);
            }
        }

        for extra in &self.config.cnc.ports {
            if !descriptors.iter().any(|d| &d.port == extra) {
                descriptors.push(PortDescriptor {
                    port: extra.clone(),
                    manufacturer: None,
                    inuse: self.in_use(extra),
                });
            }
        }

        self.registry
            .unicast(client, ServerEvent::PortList(descriptors))
            .await;
    }

    async fn open(&self, client: ClientId, port: &str, baud: u32) {
        if let Some(session) = self.registry.session(port) {
            session.attach(client);
            if session.is_open() {
                self.registry
                    .unicast(
                        client,
                        ServerEvent::PortOpened(PortOpened {
                            port: port.to_string(),
                            baudrate: session.baud(),
                            inuse: true,
                        }),
                    )
                    .await;
            }
            // An open is still in progress otherwise; the opener path will
            // announce it and this client now receives broadcasts.
            return;
        }

        Session::open(&self.registry, port, baud, client, self.config.timing.clone());
    }

    async fn close(&self, client: ClientId, port: &str) {
        let Some(session) = self.registry.session(port) else {
            tracing::warn!("Dropping close for {}: no session", port);
            return;
        };

        session.detach(client);
        let remaining = session.client_count();
        if remaining == 0 {
            session.request(SessionRequest::Close).await;
        }

        self.registry
            .unicast(
                client,
                ServerEvent::PortClosed(PortClosed {
                    port: port.to_string(),
                    inuse: remaining > 0,
                }),
            )
            .await;
    }

    /// Forward a request to an open session, or drop it with a warning.
    async fn forward(&self, port: &str, action: &str, request: SessionRequest) {
        match self.registry.session(port) {
            Some(session) if session.is_open() => session.request(request).await,
            _ => tracing::warn!("Dropping {} for {}: port not open", action, port),
        }
    }

    fn in_use(&self, port: &str) -> bool {
        self.registry
            .session(port)
            .is_some_and(|session| session.is_open())
    }
}
