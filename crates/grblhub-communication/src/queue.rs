//! Command queue with Grbl flow control.
//!
//! Holds the ordered program lines and a cursor of how many the controller
//! has acknowledged. At most one command is in flight (sent but not
//! acknowledged) at any time; dispatch happens either when the queue is
//! started ([`CommandQueue::play`]) or when an acknowledgement arrives
//! ([`CommandQueue::acknowledge`]). Both return the line to put on the wire
//! rather than writing it themselves; the session owns the transport.

/// Run state of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not streaming.
    Idle,
    /// Streaming; acknowledgements advance the cursor and dispatch.
    Running,
    /// Streaming suspended; acknowledgements are not consumed.
    Paused,
}

/// Ordered command sequence with an executed cursor
#[derive(Debug)]
pub struct CommandQueue {
    lines: Vec<String>,
    executed: usize,
    state: RunState,
    in_flight: bool,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            executed: 0,
            state: RunState::Idle,
            in_flight: false,
        }
    }

    /// Append lines; the run state is unaffected.
    pub fn push(&mut self, lines: impl IntoIterator<Item = String>) {
        self.lines.extend(lines);
    }

    /// Remove all lines and reset the cursor.
    ///
    /// A command in flight is orphaned: its eventual acknowledgement arrives
    /// with the queue not running and is not consumed here.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.executed = 0;
        self.in_flight = false;
        self.state = RunState::Idle;
    }

    /// Stop streaming and rewind the cursor to the start.
    ///
    /// The lines are kept; a later [`play`](Self::play) re-streams from the
    /// first line. An in-flight command is orphaned as in
    /// [`clear`](Self::clear).
    pub fn stop(&mut self) {
        self.state = RunState::Idle;
        self.executed = 0;
        self.in_flight = false;
    }

    /// Suspend streaming without moving the cursor.
    ///
    /// The command on the wire cannot be recalled; its acknowledgement will
    /// arrive while not running and is orphaned, so a later
    /// [`play`](Self::play) re-dispatches the line at the cursor.
    pub fn pause(&mut self) {
        self.state = RunState::Paused;
        self.in_flight = false;
    }

    /// Start (or resume) streaming.
    ///
    /// Returns the line to dispatch when nothing is in flight and lines
    /// remain; otherwise `None`.
    pub fn play(&mut self) -> Option<String> {
        self.state = RunState::Running;
        if !self.in_flight && self.executed < self.lines.len() {
            self.in_flight = true;
            return Some(self.lines[self.executed].clone());
        }
        None
    }

    /// Consume one acknowledgement while running.
    ///
    /// Advances the cursor exactly once and returns the next line to
    /// dispatch, or `None` with the queue dropping to Idle when the program
    /// is exhausted. The session only calls this while
    /// [`is_running`](Self::is_running) is true.
    pub fn acknowledge(&mut self) -> Option<String> {
        self.in_flight = false;
        if self.executed < self.lines.len() {
            self.executed += 1;
        }

        if self.state == RunState::Running {
            if self.executed < self.lines.len() {
                self.in_flight = true;
                return Some(self.lines[self.executed].clone());
            }
            self.state = RunState::Idle;
        }
        None
    }

    /// Number of queued lines
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    /// Number of acknowledged lines
    pub fn executed_count(&self) -> usize {
        self.executed
    }

    /// Whether the queue is streaming
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
