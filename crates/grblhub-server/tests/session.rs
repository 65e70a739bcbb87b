//! End-to-end session scenarios over a virtual transport.
//!
//! Each test stands up a registry, a recording client sink, and a session
//! bound to a virtual transport, then plays the device side by hand. Time is
//! paused, so the 250 ms timers fire deterministically when the test sleeps
//! across their deadlines.

use async_trait::async_trait;
use grblhub_communication::{TransportEvent, VirtualTransport};
use grblhub_core::{ClientId, QueueStatus, ServerEvent, TimingSettings};
use grblhub_server::{ingest, ClientSink, ConnectionState, Registry, Session, SessionRequest, Upload, UploadMeta};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const PORT: &str = "/dev/ttyUSB0";
const BAUD: u32 = 115200;
const BOOT_BANNER: &str = "Grbl 0.9j ['$' for help]";
const STATUS_LINE: &str = "<Idle,MPos:5.529,0.560,7.000,WPos:1.529,-5.440,-0.000>";
const MODES_LINE: &str = "[G0 G54 G17 G21 G90 G94 M0 M5 M9 T0 F2540. S0.]";

struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn all(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    fn named(&self, name: &str) -> Vec<ServerEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }

    fn serial_data(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::SerialData(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    fn queue_reports(&self) -> Vec<QueueStatus> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::QueueStatus(status) => Some(status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn deliver(&self, event: ServerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Rig {
    registry: Arc<Registry>,
    session: Arc<Session>,
    device: mpsc::Sender<TransportEvent>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Rig {
    async fn feed(&self, line: &str) {
        self.device
            .send(TransportEvent::Line(line.to_string()))
            .await
            .expect("session loop gone");
        settle().await;
    }

    fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Newline-terminated command dispatches, poll traffic excluded.
    fn dispatched(&self) -> Vec<String> {
        self.raw_writes()
            .into_iter()
            .filter(|w| w.ends_with(b"\n") && w.as_slice() != b"$G\n")
            .map(|w| String::from_utf8(w).unwrap().trim_end().to_string())
            .collect()
    }

    fn wrote(&self, bytes: &[u8]) -> bool {
        self.raw_writes().iter().any(|w| w.as_slice() == bytes)
    }
}

/// Let queued events and requests drain without crossing a timer deadline.
async fn settle() {
    sleep(Duration::from_millis(2)).await;
}

/// One full 250 ms timer period.
async fn tick() {
    sleep(Duration::from_millis(260)).await;
}

/// Stand up a registry, one client, and a session on a virtual transport.
async fn open_rig() -> (Rig, ClientId, Arc<RecordingSink>) {
    let registry = Arc::new(Registry::new());
    let client = ClientId::new_v4();
    let sink = RecordingSink::new();
    registry.register_client(client, sink.clone());

    let (transport, device, events) = VirtualTransport::new(PORT);
    let writes = transport.writes();
    let session = Session::open_with_transport(
        &registry,
        PORT,
        BAUD,
        client,
        TimingSettings::default(),
        Box::new(transport),
        events,
    );

    device.send(TransportEvent::Opened).await.unwrap();
    settle().await;

    (
        Rig {
            registry,
            session,
            device,
            writes,
        },
        client,
        sink,
    )
}

/// As [`open_rig`], but also boot the controller into Ready.
async fn boot_rig() -> (Rig, ClientId, Arc<RecordingSink>) {
    let (rig, client, sink) = open_rig().await;
    rig.feed(BOOT_BANNER).await;
    (rig, client, sink)
}

/// Attach a second client with its own sink.
fn attach_client(rig: &Rig) -> (ClientId, Arc<RecordingSink>) {
    let client = ClientId::new_v4();
    let sink = RecordingSink::new();
    rig.registry.register_client(client, sink.clone());
    rig.session.attach(client);
    (client, sink)
}

async fn load_program(rig: &Rig, lines: &str) {
    ingest(
        &rig.registry,
        Upload {
            meta: UploadMeta {
                port: PORT.to_string(),
                name: "part.nc".to_string(),
            },
            contents: lines.to_string(),
        },
    )
    .await
    .expect("ingest failed");
    settle().await;
}

// Opening a port soft-resets the controller and boots into polling.
#[tokio::test(start_paused = true)]
async fn test_open_and_boot() {
    let (rig, _client, sink) = open_rig().await;

    // The opener is told the port is held, and the controller is reset.
    let opened = sink.named("serialport:open");
    assert_eq!(opened.len(), 1);
    if let ServerEvent::PortOpened(o) = &opened[0] {
        assert_eq!(o.port, PORT);
        assert_eq!(o.baudrate, BAUD);
        assert!(o.inuse);
    }
    assert!(rig.wrote(&[0x18]));
    assert_eq!(rig.session.connection_state(), ConnectionState::WaitBoot);

    // No polls before the boot banner.
    tick().await;
    assert!(!rig.wrote(b"?"));

    rig.feed(BOOT_BANNER).await;
    assert_eq!(rig.session.connection_state(), ConnectionState::Ready);

    // Both polls go out within one timer period of becoming ready.
    tick().await;
    assert!(rig.wrote(b"?"));
    assert!(rig.wrote(b"$G\n"));
}

// A status report is broadcast to everyone and echoed to whoever asked.
#[tokio::test(start_paused = true)]
async fn test_status_routing() {
    let (rig, client_a, sink_a) = boot_rig().await;
    let (_client_b, sink_b) = attach_client(&rig);

    rig.session
        .request(SessionRequest::Write {
            client: client_a,
            payload: "?".to_string(),
        })
        .await;
    settle().await;
    assert!(rig.wrote(b"?"));

    rig.feed(STATUS_LINE).await;

    // Everyone gets the parsed status.
    for sink in [&sink_a, &sink_b] {
        let statuses = sink.named("grbl:current-status");
        assert_eq!(statuses.len(), 1);
        if let ServerEvent::CurrentStatus(s) = &statuses[0] {
            assert_eq!(s.active_state, "Idle");
            assert_eq!(s.machine_pos.x, "5.529");
            assert_eq!(s.machine_pos.y, "0.560");
            assert_eq!(s.machine_pos.z, "7.000");
            assert_eq!(s.working_pos.x, "1.529");
            assert_eq!(s.working_pos.y, "-5.440");
            assert_eq!(s.working_pos.z, "-0.000");
        }
    }

    // Only the asker gets the raw echo.
    assert_eq!(sink_a.serial_data(), vec![STATUS_LINE.to_string()]);
    assert!(sink_b.serial_data().is_empty());

    // The asker's tag was cleared: a second report is not echoed again.
    rig.feed(STATUS_LINE).await;
    assert_eq!(sink_a.serial_data().len(), 1);
    assert_eq!(sink_a.named("grbl:current-status").len(), 2);
}

// A $G cycle: modes broadcast, both raw lines echoed to the asker only.
#[tokio::test(start_paused = true)]
async fn test_gcode_modes_cycle() {
    let (rig, _client_a, sink_a) = boot_rig().await;
    let (client_b, sink_b) = attach_client(&rig);

    rig.session
        .request(SessionRequest::Write {
            client: client_b,
            payload: "$G\n".to_string(),
        })
        .await;
    settle().await;

    rig.feed(MODES_LINE).await;
    rig.feed("ok").await;

    // Everyone gets the token list.
    for sink in [&sink_a, &sink_b] {
        let modes = sink.named("grbl:gcode-modes");
        assert_eq!(modes.len(), 1);
        if let ServerEvent::GcodeModes(tokens) = &modes[0] {
            assert_eq!(tokens[0], "G0");
            assert_eq!(tokens[10], "F2540.");
            assert_eq!(tokens.len(), 12);
        }
    }

    // The asker gets raw echoes of both lines, nobody else does.
    assert_eq!(
        sink_b.serial_data(),
        vec![MODES_LINE.to_string(), "ok".to_string()]
    );
    assert!(sink_a.serial_data().is_empty());

    // The tag is gone after the trailing ok: a later unsolicited cycle is
    // not echoed to B again.
    rig.feed(MODES_LINE).await;
    rig.feed("ok").await;
    assert_eq!(sink_b.serial_data().len(), 2);
}

// The hardest invariant: an ok following a $G report belongs to the $G
// cycle, never to the running queue.
#[tokio::test(start_paused = true)]
async fn test_gstate_ack_has_first_refusal() {
    let (rig, client, sink) = boot_rig().await;

    load_program(&rig, "G0 X10\nG0 Y10\n").await;
    rig.session.request(SessionRequest::Play).await;
    settle().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10"]);

    // A $G cycle completes while the first command is still in flight.
    rig.session
        .request(SessionRequest::Write {
            client,
            payload: "$G\n".to_string(),
        })
        .await;
    settle().await;
    rig.feed(MODES_LINE).await;
    rig.feed("ok").await;

    // That ok fed the $G cycle: the queue did not advance.
    assert_eq!(rig.dispatched(), vec!["G0 X10"]);
    assert_eq!(sink.serial_data(), vec![MODES_LINE.to_string(), "ok".to_string()]);

    // The next ok is the command acknowledgement and advances the queue.
    rig.feed("ok").await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10"]);
}

// Program streaming keeps one command in flight at a time.
#[tokio::test(start_paused = true)]
async fn test_queue_dispatch() {
    let (rig, _client, sink) = boot_rig().await;

    load_program(&rig, "G0 X10\nG0 Y10\nG0 Z0\n").await;
    tick().await;

    rig.session.request(SessionRequest::Play).await;
    settle().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10"]);

    rig.feed("ok").await;
    tick().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10"]);

    rig.feed("ok").await;
    tick().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10", "G0 Z0"]);

    rig.feed("ok").await;
    tick().await;
    assert_eq!(rig.dispatched().len(), 3);

    // Progress was reported exactly at each distinct (executed, total).
    assert_eq!(
        sink.queue_reports(),
        vec![
            QueueStatus { executed: 0, total: 3 },
            QueueStatus { executed: 1, total: 3 },
            QueueStatus { executed: 2, total: 3 },
            QueueStatus { executed: 3, total: 3 },
        ]
    );
}

// A Grbl error reply advances the queue exactly like ok.
#[tokio::test(start_paused = true)]
async fn test_error_ack_advances_queue() {
    let (rig, _client, _sink) = boot_rig().await;

    load_program(&rig, "G0 X10\nG0 Y10\n").await;
    rig.session.request(SessionRequest::Play).await;
    settle().await;

    rig.feed("error: Bad number format").await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10"]);
}

// Pause holds the cursor; stop rewinds without truncating.
#[tokio::test(start_paused = true)]
async fn test_pause_and_stop() {
    let (rig, _client, sink) = boot_rig().await;

    load_program(&rig, "G0 X10\nG0 Y10\nG0 Z0\n").await;
    rig.session.request(SessionRequest::Play).await;
    settle().await;

    rig.feed("ok").await;
    tick().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10"]);

    rig.session.request(SessionRequest::Pause).await;
    settle().await;

    // The in-flight command's ack arrives while paused: nothing more goes
    // on the wire and the cursor holds at 1.
    rig.feed("ok").await;
    tick().await;
    assert_eq!(rig.dispatched(), vec!["G0 X10", "G0 Y10"]);
    let last = *sink.queue_reports().last().unwrap();
    assert_eq!(last, QueueStatus { executed: 1, total: 3 });

    // Stop rewinds without truncating; run re-streams from the start.
    rig.session.request(SessionRequest::Stop).await;
    tick().await;
    let last = *sink.queue_reports().last().unwrap();
    assert_eq!(last, QueueStatus { executed: 0, total: 3 });

    rig.session.request(SessionRequest::Play).await;
    settle().await;
    assert_eq!(
        rig.dispatched(),
        vec!["G0 X10", "G0 Y10", "G0 X10"]
    );
}

// An ack with no solicited consumer and no running queue is plain data.
#[tokio::test(start_paused = true)]
async fn test_orphaned_ack_falls_through() {
    let (rig, _client, sink) = boot_rig().await;

    load_program(&rig, "G0 X10\n").await;
    rig.session.request(SessionRequest::Play).await;
    settle().await;

    rig.session.request(SessionRequest::Unload).await;
    settle().await;

    // The orphaned command's ack is broadcast, not counted.
    rig.feed("ok").await;
    assert_eq!(sink.serial_data(), vec!["ok".to_string()]);
    assert_eq!(rig.dispatched(), vec!["G0 X10"]);
}

// A client disconnect leaves the session running for the others.
#[tokio::test(start_paused = true)]
async fn test_client_disconnect_keeps_session() {
    let (rig, client_a, _sink_a) = boot_rig().await;
    let (_client_b, sink_b) = attach_client(&rig);

    rig.registry.unregister_client(client_a);
    settle().await;

    assert!(rig.session.is_open());
    assert_eq!(rig.registry.session_count(), 1);
    assert_eq!(rig.session.client_count(), 1);

    rig.feed(STATUS_LINE).await;
    assert_eq!(sink_b.named("grbl:current-status").len(), 1);
}

// Unexpected transport close tears the session down.
#[tokio::test(start_paused = true)]
async fn test_transport_close_tears_down() {
    let (rig, _client, sink) = boot_rig().await;

    rig.device.send(TransportEvent::Closed).await.unwrap();
    settle().await;

    let closed = sink.named("serialport:close");
    assert_eq!(closed.len(), 1);
    if let ServerEvent::PortClosed(c) = &closed[0] {
        assert_eq!(c.port, PORT);
        assert!(!c.inuse);
    }
    assert_eq!(rig.registry.session_count(), 0);
    assert_eq!(rig.session.connection_state(), ConnectionState::Closed);
}

// Transport error tears down with serialport:error.
#[tokio::test(start_paused = true)]
async fn test_transport_error_tears_down() {
    let (rig, _client, sink) = boot_rig().await;

    rig.device
        .send(TransportEvent::Error("device unplugged".to_string()))
        .await
        .unwrap();
    settle().await;

    assert_eq!(sink.named("serialport:error").len(), 1);
    assert_eq!(rig.registry.session_count(), 0);
}

// A reopened upload replaces the queue and rewinds progress reporting.
#[tokio::test(start_paused = true)]
async fn test_reingest_replaces_program() {
    let (rig, _client, sink) = boot_rig().await;

    load_program(&rig, "G0 X10\nG0 Y10\nG0 Z0\n").await;
    tick().await;
    load_program(&rig, "G1 Z-1\nG1 Z0\n").await;
    tick().await;

    assert_eq!(
        sink.queue_reports(),
        vec![
            QueueStatus { executed: 0, total: 3 },
            QueueStatus { executed: 0, total: 2 },
        ]
    );

    rig.session.request(SessionRequest::Play).await;
    settle().await;
    assert_eq!(rig.dispatched(), vec!["G1 Z-1"]);
}

// Polls are suppressed while their reply is outstanding.
#[tokio::test(start_paused = true)]
async fn test_poll_flags_suppress_reissue() {
    let (rig, _client, _sink) = boot_rig().await;

    tick().await;
    tick().await;
    tick().await;

    // No status report or parser state was fed back, so each query went out
    // exactly once.
    let writes = rig.raw_writes();
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"?").count(), 1);
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"$G\n").count(), 1);

    // A status report re-arms the status poll only.
    rig.feed(STATUS_LINE).await;
    tick().await;
    let writes = rig.raw_writes();
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"?").count(), 2);
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"$G\n").count(), 1);
}

// A failed device open reports serialport:error and removes the session.
#[tokio::test]
async fn test_open_failure_reports_error() {
    let registry = Arc::new(Registry::new());
    let client = ClientId::new_v4();
    let sink = RecordingSink::new();
    registry.register_client(client, sink.clone());

    Session::open(
        &registry,
        "/dev/grblhub-does-not-exist",
        BAUD,
        client,
        TimingSettings::default(),
    );

    for _ in 0..100 {
        if registry.session_count() == 0 && !sink.named("serialport:error").is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(sink.named("serialport:error").len(), 1);
    assert_eq!(registry.session_count(), 0);
}

// The boot banner resets every pending flag, even mid-cycle.
#[tokio::test(start_paused = true)]
async fn test_boot_resets_pending() {
    let (rig, _client, _sink) = boot_rig().await;

    tick().await;
    let writes = rig.raw_writes();
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"?").count(), 1);

    // Controller restarts spontaneously; both polls resume afterwards.
    rig.feed(BOOT_BANNER).await;
    tick().await;
    let writes = rig.raw_writes();
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"?").count(), 2);
    assert_eq!(writes.iter().filter(|w| w.as_slice() == b"$G\n").count(), 2);
}
