//! Client registry and event fan-out.
//!
//! Process-wide state: the `port → Session` map and the `client → sink` map.
//! Sessions store client ids only; sinks are resolved here at emit time, so
//! no ownership cycle forms between sessions and the socket layer.

use crate::session::Session;
use async_trait::async_trait;
use grblhub_core::{ClientId, ServerEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Receiving end of a client connection.
///
/// Implemented by the socket layer; the core only ever hands it events.
#[async_trait]
pub trait ClientSink: Send + Sync {
    /// Deliver one named event to the client.
    async fn deliver(&self, event: ServerEvent);
}

/// Process-wide session and client state
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    sinks: RwLock<HashMap<ClientId, Arc<dyn ClientSink>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sinks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a client's event sink
    pub fn register_client(&self, client: ClientId, sink: Arc<dyn ClientSink>) {
        self.sinks.write().insert(client, sink);
        tracing::debug!("Client {} registered", client);
    }

    /// Remove a disconnected client.
    ///
    /// Detaches it from every session. Sessions left without clients stay
    /// open; only the explicit close command path closes the transport.
    pub fn unregister_client(&self, client: ClientId) {
        self.sinks.write().remove(&client);
        for session in self.sessions.read().values() {
            session.detach(client);
        }
        tracing::debug!("Client {} unregistered", client);
    }

    /// Look up the session holding a port
    pub fn session(&self, port: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(port).cloned()
    }

    /// Insert a session under its port name
    pub fn insert_session(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .insert(session.port().to_string(), session);
    }

    /// Remove the session for a port
    pub fn remove_session(&self, port: &str) {
        self.sessions.write().remove(port);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Send an event to every client attached to a session
    pub async fn broadcast(&self, session: &Session, event: ServerEvent) {
        let targets = self.resolve(&session.client_ids());
        for sink in targets {
            sink.deliver(event.clone()).await;
        }
    }

    /// Send an event to a single client
    pub async fn unicast(&self, client: ClientId, event: ServerEvent) {
        let sink = self.sinks.read().get(&client).cloned();
        if let Some(sink) = sink {
            sink.deliver(event).await;
        }
    }

    /// Send an event to a list of clients
    pub async fn multicast(&self, clients: &[ClientId], event: ServerEvent) {
        let targets = self.resolve(clients);
        for sink in targets {
            sink.deliver(event.clone()).await;
        }
    }

    /// Resolve client ids to sinks, dropping ids whose client is gone.
    fn resolve(&self, clients: &[ClientId]) -> Vec<Arc<dyn ClientSink>> {
        let sinks = self.sinks.read();
        clients
            .iter()
            .filter_map(|id| sinks.get(id).cloned())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
