//! Grbl reply classification.
//!
//! Grbl interleaves solicited replies (status reports, parser state) with
//! acknowledgements and unsolicited chatter on one line stream. This module
//! classifies a single trimmed line; deciding what a classification *means*
//! given the session's pending queries is the session's job.

use grblhub_core::Coordinates;
use serde::{Deserialize, Serialize};

/// Machine state carried by a status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// Stopped, awaiting commands.
    Idle,
    /// Executing motion.
    Run,
    /// Feed hold in effect.
    Hold,
    /// Safety door open.
    Door,
    /// Homing cycle in progress.
    Home,
    /// Alarm lock; motion rejected.
    Alarm,
    /// Check mode; g-code parsed but not executed.
    Check,
}

impl MachineState {
    /// Parse a state name as it appears in a status report
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Idle" => Some(Self::Idle),
            "Run" => Some(Self::Run),
            "Hold" => Some(Self::Hold),
            "Door" => Some(Self::Door),
            "Home" => Some(Self::Home),
            "Alarm" => Some(Self::Alarm),
            "Check" => Some(Self::Check),
            _ => None,
        }
    }

    /// The state name as Grbl reports it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Door => "Door",
            Self::Home => "Home",
            Self::Alarm => "Alarm",
            Self::Check => "Check",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed `<STATE,MPos:…,WPos:…>` status report.
///
/// Coordinates are kept as the decimal strings Grbl sent; the bridge
/// forwards them without re-parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Machine state.
    pub state: MachineState,
    /// Position in machine coordinates.
    pub machine_pos: Coordinates,
    /// Position in work coordinates.
    pub work_pos: Coordinates,
}

/// A classified line from the controller
#[derive(Debug, Clone, PartialEq)]
pub enum GrblLine {
    /// Boot banner (`Grbl 0.9j ['$' for help]`).
    Boot,
    /// Status report, reply to `?`.
    Status(StatusReport),
    /// Parser state tokens, reply to `$G`.
    ParserState(Vec<String>),
    /// `ok` acknowledgement.
    AckOk,
    /// `error …` acknowledgement with the remainder text.
    AckError(String),
    /// Anything else, verbatim.
    Other(String),
}

/// Classify a single trimmed line.
///
/// Lines arrive with their newline already stripped; status and parser-state
/// replies are matched as-is with no trailing-newline assumptions.
pub fn classify(line: &str) -> GrblLine {
    if line.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("grbl")) {
        return GrblLine::Boot;
    }

    if let Some(inner) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
        if let Some(report) = parse_status(inner) {
            return GrblLine::Status(report);
        }
        return GrblLine::Other(line.to_string());
    }

    if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        if let Some(tokens) = parse_parser_state(inner) {
            return GrblLine::ParserState(tokens);
        }
        return GrblLine::Other(line.to_string());
    }

    if line.starts_with("ok") {
        return GrblLine::AckOk;
    }

    if let Some(rest) = line.strip_prefix("error") {
        return GrblLine::AckError(rest.trim_start_matches(':').trim().to_string());
    }

    GrblLine::Other(line.to_string())
}

/// Check that a coordinate field is plain decimal text.
fn is_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|&c| c == '.').count() <= 1
        && digits.chars().any(|c| c.is_ascii_digit())
}

/// Parse the inside of `<STATE,MPos:x,y,z,WPos:x,y,z>`.
fn parse_status(inner: &str) -> Option<StatusReport> {
    let fields: Vec<&str> = inner.split(',').collect();
    if fields.len() != 7 {
        return None;
    }

    let state = MachineState::parse(fields[0])?;
    let mx = fields[1].strip_prefix("MPos:")?;
    let wx = fields[4].strip_prefix("WPos:")?;

    let coords = [mx, fields[2], fields[3], wx, fields[5], fields[6]];
    if !coords.iter().all(|c| is_decimal(c)) {
        return None;
    }

    Some(StatusReport {
        state,
        machine_pos: Coordinates::new(coords[0], coords[1], coords[2]),
        work_pos: Coordinates::new(coords[3], coords[4], coords[5]),
    })
}

/// Parse the inside of `[TOKEN TOKEN …]`.
fn parse_parser_state(inner: &str) -> Option<Vec<String>> {
    let tokens: Vec<String> = inner
        .split_whitespace()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.is_empty() {
        return None;
    }

    let valid = tokens.iter().all(|t| {
        t.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
    });

    if valid {
        Some(tokens)
    } else {
        None
    }
}
