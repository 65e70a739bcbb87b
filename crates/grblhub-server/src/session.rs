//! Per-port Grbl session.
//!
//! The session is the coordinator for one open serial port: it owns the
//! transport, the command queue, and the two 250 ms timers, and it is the
//! only place the Grbl reply stream is interpreted. All state mutation
//! happens on the session's own task; the rest of the process talks to it
//! through [`SessionRequest`] messages and the small amount of shared state
//! (connection state, client bindings) needed for attach/detach and `inuse`
//! checks.
//!
//! # Reply routing
//!
//! Grbl never tags replies, so ordering discipline is everything:
//!
//! - a status poll (`?`) is outstanding until the next `<…>` report;
//! - a parser-state query (`$G`) is outstanding until its `[…]` report *and*
//!   the `ok` that follows it — that `ok` must be consumed by the `$G` cycle
//!   before the queue may interpret it as a command acknowledgement;
//! - every other `ok`/`error` belongs to the queue while it is running, and
//!   is otherwise broadcast as plain data.
//!
//! The `pending` flags enforce that at most one query of each kind is ever
//! outstanding.

use crate::registry::Registry;
use grblhub_communication::{
    classify, CommandQueue, GrblLine, SerialTransport, Transport, TransportEvent,
};
use grblhub_core::{
    ClientId, CurrentStatus, PortClosed, PortError, PortOpened, QueueStatus, ServerEvent,
    TimingSettings,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Capacity of the router → session request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Grbl soft-reset, sent once per (re)open.
const SOFT_RESET: u8 = 0x18;

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Closed,
    /// Transport open in progress.
    Opening,
    /// Transport open; clearing state and sending the soft reset.
    Resetting,
    /// Reset sent; waiting for the boot banner.
    WaitBoot,
    /// Boot banner seen; polling is active.
    Ready,
}

/// Per-client state held by a session
#[derive(Debug, Default)]
pub struct ClientBinding {
    /// The most recent raw payload this client wrote, used to route the
    /// matching reply back to it. Cleared once the reply is delivered.
    pub last_command: Option<String>,
}

/// Outstanding solicited queries
#[derive(Debug, Default, Clone, Copy)]
struct PendingPolls {
    /// A `?` has been written and its `<…>` report not yet seen.
    status_poll: bool,
    /// A `$G` has been written and its `[…]` report not yet seen.
    gstate_poll: bool,
    /// The `[…]` report arrived; its trailing `ok` not yet seen.
    gstate_awaiting_ack: bool,
}

/// Request from the router to a session task
#[derive(Debug)]
pub enum SessionRequest {
    /// Write raw bytes and tag the client for reply routing.
    Write {
        /// Originating client.
        client: ClientId,
        /// Raw payload, written verbatim (no newline appended).
        payload: String,
    },
    /// Start or resume streaming the queue.
    Play,
    /// Suspend streaming.
    Pause,
    /// Stop streaming and rewind.
    Stop,
    /// Discard the loaded program.
    Unload,
    /// Replace the queue contents with a freshly ingested program.
    LoadProgram {
        /// Original program text, kept for reference.
        text: String,
        /// Stripped lines to stream.
        lines: Vec<String>,
    },
    /// Close the transport; the session tears down when the close lands.
    Close,
}

/// Handle to a per-port session
///
/// Owned by the [`Registry`]; the IO loop runs on its own tokio task and
/// tears the session down (removing it from the registry) when the
/// transport goes away.
pub struct Session {
    port: String,
    baud: u32,
    state: RwLock<ConnectionState>,
    clients: RwLock<HashMap<ClientId, ClientBinding>>,
    requests: mpsc::Sender<SessionRequest>,
}

impl Session {
    /// Open a serial port and spawn the session task.
    ///
    /// The session is registered and the opening client attached before this
    /// returns, so concurrent `open` requests for the same port find it. The
    /// actual device open happens on the task; on failure the opener gets
    /// `serialport:error` and the session removes itself.
    pub fn open(
        registry: &Arc<Registry>,
        port: &str,
        baud: u32,
        opener: ClientId,
        timing: TimingSettings,
    ) -> Arc<Self> {
        let (session, requests) = Self::register(registry, port, baud, opener);

        let task_session = session.clone();
        let task_registry = registry.clone();
        let task_port = port.to_string();
        tokio::spawn(async move {
            match SerialTransport::open(&task_port, baud) {
                Ok((transport, events)) => {
                    SessionTask::new(task_session, task_registry, Box::new(transport), opener)
                        .run(events, requests, timing)
                        .await;
                }
                Err(e) => {
                    tracing::error!("Failed to open {}: {}", task_port, e);
                    *task_session.state.write() = ConnectionState::Closed;
                    task_registry
                        .unicast(
                            opener,
                            ServerEvent::PortError(PortError {
                                port: task_port.clone(),
                            }),
                        )
                        .await;
                    task_registry.remove_session(&task_port);
                }
            }
        });

        session
    }

    /// Spawn a session over an already-built transport.
    ///
    /// Test seam: lets a virtual transport stand in for the serial device.
    pub fn open_with_transport(
        registry: &Arc<Registry>,
        port: &str,
        baud: u32,
        opener: ClientId,
        timing: TimingSettings,
        transport: Box<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Arc<Self> {
        let (session, requests) = Self::register(registry, port, baud, opener);

        let task = SessionTask::new(session.clone(), registry.clone(), transport, opener);
        tokio::spawn(task.run(events, requests, timing));

        session
    }

    fn register(
        registry: &Arc<Registry>,
        port: &str,
        baud: u32,
        opener: ClientId,
    ) -> (Arc<Self>, mpsc::Receiver<SessionRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let session = Arc::new(Self {
            port: port.to_string(),
            baud,
            state: RwLock::new(ConnectionState::Opening),
            clients: RwLock::new(HashMap::new()),
            requests: tx,
        });
        registry.insert_session(session.clone());
        session.attach(opener);
        (session, rx)
    }

    /// The port this session holds
    pub fn port(&self) -> &str {
        &self.port
    }

    /// The baud rate the port was opened at
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        matches!(
            *self.state.read(),
            ConnectionState::Resetting | ConnectionState::WaitBoot | ConnectionState::Ready
        )
    }

    /// Attach a client; a no-op if it is already attached.
    pub fn attach(&self, client: ClientId) {
        self.clients.write().entry(client).or_default();
    }

    /// Detach a client
    pub fn detach(&self, client: ClientId) {
        self.clients.write().remove(&client);
    }

    /// Number of attached clients
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Ids of all attached clients
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().copied().collect()
    }

    /// Send a request to the session task.
    pub async fn request(&self, request: SessionRequest) {
        if self.requests.send(request).await.is_err() {
            tracing::debug!("Session {} is gone; request dropped", self.port);
        }
    }

    /// Record a client's most recent write for reply routing.
    fn set_last_command(&self, client: ClientId, payload: String) {
        if let Some(binding) = self.clients.write().get_mut(&client) {
            binding.last_command = Some(payload);
        }
    }

    /// Clients whose pending command matches, leaving the tag in place.
    fn clients_with_command(&self, pred: impl Fn(&str) -> bool) -> Vec<ClientId> {
        self.clients
            .read()
            .iter()
            .filter(|(_, b)| b.last_command.as_deref().is_some_and(&pred))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Clients whose pending command matches, clearing the tag.
    fn take_clients_with_command(&self, pred: impl Fn(&str) -> bool) -> Vec<ClientId> {
        let mut clients = self.clients.write();
        let mut matched = Vec::new();
        for (id, binding) in clients.iter_mut() {
            if binding.last_command.as_deref().is_some_and(&pred) {
                binding.last_command = None;
                matched.push(*id);
            }
        }
        matched
    }
}

/// State owned by the session task
struct SessionTask {
    session: Arc<Session>,
    registry: Arc<Registry>,
    transport: Box<dyn Transport>,
    queue: CommandQueue,
    pending: PendingPolls,
    gcode_text: String,
    opener: ClientId,
    last_reported: (usize, usize),
}

impl SessionTask {
    fn new(
        session: Arc<Session>,
        registry: Arc<Registry>,
        transport: Box<dyn Transport>,
        opener: ClientId,
    ) -> Self {
        Self {
            session,
            registry,
            transport,
            queue: CommandQueue::new(),
            pending: PendingPolls::default(),
            gcode_text: String::new(),
            opener,
            last_reported: (0, 0),
        }
    }

    /// The session event loop.
    ///
    /// Lines are processed in arrival order, and all fan-out triggered by a
    /// line is delivered before the next line is taken.
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut requests: mpsc::Receiver<SessionRequest>,
        timing: TimingSettings,
    ) {
        let mut poll = interval(Duration::from_millis(timing.status_poll_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval(Duration::from_millis(timing.queue_report_ms));
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Opened) => self.enter_resetting().await,
                    Some(TransportEvent::Line(line)) => self.handle_line(&line).await,
                    Some(TransportEvent::Error(reason)) => {
                        self.teardown_error(&reason).await;
                        break;
                    }
                    Some(TransportEvent::Closed) | None => {
                        self.teardown_closed().await;
                        break;
                    }
                },
                request = requests.recv() => {
                    // The session handle holds the sender, so recv() cannot
                    // return None while the task runs.
                    if let Some(request) = request {
                        self.handle_request(request).await;
                    }
                },
                _ = poll.tick() => self.poll_tick(),
                _ = report.tick() => self.report_tick().await,
            }
        }
    }

    /// Transport is open: wipe session state, tell the opener, soft-reset.
    async fn enter_resetting(&mut self) {
        *self.session.state.write() = ConnectionState::Resetting;
        self.pending = PendingPolls::default();
        self.gcode_text.clear();
        self.queue.stop();
        self.queue.clear();

        self.registry
            .unicast(
                self.opener,
                ServerEvent::PortOpened(PortOpened {
                    port: self.session.port.clone(),
                    baudrate: self.session.baud,
                    inuse: true,
                }),
            )
            .await;

        if let Err(e) = self.transport.write(&[SOFT_RESET]) {
            tracing::warn!("Soft reset on {} failed: {}", self.session.port, e);
        }
        *self.session.state.write() = ConnectionState::WaitBoot;
    }

    /// Classify one line and route it.
    ///
    /// The match order is load-bearing: the `$G` cycle gets first refusal on
    /// an acknowledgement, then the running queue, and only then does the
    /// line fall through to a plain data broadcast.
    async fn handle_line(&mut self, line: &str) {
        let line = line.trim();

        match classify(line) {
            GrblLine::Boot => {
                self.pending = PendingPolls::default();
                *self.session.state.write() = ConnectionState::Ready;
                tracing::info!("Controller on {} is ready", self.session.port);
            }
            GrblLine::Status(report) => {
                self.registry
                    .broadcast(
                        &self.session,
                        ServerEvent::CurrentStatus(CurrentStatus {
                            active_state: report.state.to_string(),
                            machine_pos: report.machine_pos,
                            working_pos: report.work_pos,
                        }),
                    )
                    .await;

                let askers = self.session.take_clients_with_command(|cmd| cmd.trim() == "?");
                self.registry
                    .multicast(&askers, ServerEvent::SerialData(line.to_string()))
                    .await;

                self.pending.status_poll = false;
            }
            GrblLine::ParserState(tokens) => {
                self.registry
                    .broadcast(&self.session, ServerEvent::GcodeModes(tokens))
                    .await;

                // The asker's tag survives until the trailing ok is routed.
                let askers = self.session.clients_with_command(|cmd| cmd.starts_with("$G"));
                self.registry
                    .multicast(&askers, ServerEvent::SerialData(line.to_string()))
                    .await;

                self.pending.gstate_poll = false;
                self.pending.gstate_awaiting_ack = true;
            }
            GrblLine::AckOk | GrblLine::AckError(_) => {
                if self.pending.gstate_awaiting_ack {
                    let askers = self
                        .session
                        .take_clients_with_command(|cmd| cmd.starts_with("$G"));
                    self.registry
                        .multicast(&askers, ServerEvent::SerialData(line.to_string()))
                        .await;
                    self.pending.gstate_awaiting_ack = false;
                } else if self.queue.is_running() {
                    if let Some(next) = self.queue.acknowledge() {
                        self.dispatch(&next);
                    }
                } else if !line.is_empty() {
                    // No solicited consumer; orphaned acks land here too.
                    self.registry
                        .broadcast(&self.session, ServerEvent::SerialData(line.to_string()))
                        .await;
                }
            }
            GrblLine::Other(raw) => {
                if !raw.is_empty() {
                    self.registry
                        .broadcast(&self.session, ServerEvent::SerialData(raw))
                        .await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Write { client, payload } => {
                match self.transport.write(payload.as_bytes()) {
                    Ok(()) => self.session.set_last_command(client, payload),
                    Err(e) => {
                        tracing::warn!("Dropping write to {}: {}", self.session.port, e)
                    }
                }
            }
            SessionRequest::Play => {
                if let Some(line) = self.queue.play() {
                    self.dispatch(&line);
                }
            }
            SessionRequest::Pause => self.queue.pause(),
            SessionRequest::Stop => self.queue.stop(),
            SessionRequest::Unload => {
                tracing::debug!(
                    "Unloading {} byte(s) of program text on {}",
                    self.gcode_text.len(),
                    self.session.port
                );
                self.gcode_text.clear();
                self.queue.clear();
            }
            SessionRequest::LoadProgram { text, lines } => {
                tracing::info!(
                    "Loaded {} command(s) for {}",
                    lines.len(),
                    self.session.port
                );
                self.gcode_text = text;
                self.queue.stop();
                self.queue.clear();
                self.queue.push(lines);
            }
            SessionRequest::Close => self.transport.close(),
        }
    }

    /// Put one queued command on the wire, newline-terminated.
    fn dispatch(&mut self, line: &str) {
        let framed = format!("{}\n", line);
        if let Err(e) = self.transport.write(framed.as_bytes()) {
            tracing::warn!("Dispatch on {} failed: {}", self.session.port, e);
        }
    }

    /// Issue the periodic `?` and `$G` queries.
    ///
    /// Each kind is gated on its pending flag, so a query is never reissued
    /// while its reply is outstanding and the next matching reply is
    /// unambiguous.
    fn poll_tick(&mut self) {
        if self.session.connection_state() != ConnectionState::Ready {
            return;
        }

        if !self.pending.status_poll {
            self.pending.status_poll = true;
            if let Err(e) = self.transport.write(b"?") {
                tracing::warn!("Status poll on {} failed: {}", self.session.port, e);
            }
        }

        if !self.pending.gstate_poll && !self.pending.gstate_awaiting_ack {
            self.pending.gstate_poll = true;
            if let Err(e) = self.transport.write(b"$G\n") {
                tracing::warn!("Parser-state poll on {} failed: {}", self.session.port, e);
            }
        }
    }

    /// Broadcast queue progress when it changed since the last report.
    async fn report_tick(&mut self) {
        let snapshot = (self.queue.size(), self.queue.executed_count());
        if snapshot != self.last_reported {
            self.registry
                .broadcast(
                    &self.session,
                    ServerEvent::QueueStatus(QueueStatus {
                        executed: snapshot.1,
                        total: snapshot.0,
                    }),
                )
                .await;
            self.last_reported = snapshot;
        }
    }

    async fn teardown_closed(&mut self) {
        tracing::info!("Session on {} closed", self.session.port);
        self.registry
            .broadcast(
                &self.session,
                ServerEvent::PortClosed(PortClosed {
                    port: self.session.port.clone(),
                    inuse: false,
                }),
            )
            .await;
        self.finish();
    }

    async fn teardown_error(&mut self, reason: &str) {
        tracing::error!("Session on {} failed: {}", self.session.port, reason);
        self.registry
            .broadcast(
                &self.session,
                ServerEvent::PortError(PortError {
                    port: self.session.port.clone(),
                }),
            )
            .await;
        self.finish();
    }

    fn finish(&mut self) {
        *self.session.state.write() = ConnectionState::Closed;
        self.registry.remove_session(&self.session.port);
    }
}
