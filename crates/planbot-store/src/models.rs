use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk state schema version.
pub const STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The orchestrator's durable phase for the active ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

// ---------------------------------------------------------------------------

/// Status of a ticket in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Pending,
    Planning,
    AwaitingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl TicketStatus {
    /// Whether this status is terminal (the ticket will not run again
    /// within this queue run).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = TicketStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(TicketStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketStatus`] string.
#[derive(Debug, Clone)]
pub struct TicketStatusParseError(pub String);

impl fmt::Display for TicketStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket status: {:?}", self.0)
    }
}

impl std::error::Error for TicketStatusParseError {}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A clarifying question the assistant asked that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub id: String,
    pub ticket_id: String,
    pub text: String,
    pub asked_at: DateTime<Utc>,
}

/// The orchestrator's persisted run state.
///
/// Written atomically after every phase transition so a killed process can
/// resume exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub version: u32,
    pub current_ticket_id: Option<String>,
    pub current_phase: Phase,
    pub session_id: Option<String>,
    pub pause_requested: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_questions: Vec<PendingQuestion>,
}

impl State {
    /// A fresh idle state stamped with the current time.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            current_ticket_id: None,
            current_phase: Phase::Idle,
            session_id: None,
            pause_requested: false,
            started_at: now,
            last_updated_at: now,
            pending_questions: Vec::new(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for phase in [
            Phase::Idle,
            Phase::Planning,
            Phase::AwaitingApproval,
            Phase::Executing,
        ] {
            let parsed: Phase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
    }

    #[test]
    fn phase_rejects_unknown() {
        assert!("resting".parse::<Phase>().is_err());
    }

    #[test]
    fn ticket_status_round_trips_through_str() {
        for status in [
            TicketStatus::Pending,
            TicketStatus::Planning,
            TicketStatus::AwaitingApproval,
            TicketStatus::Approved,
            TicketStatus::Executing,
            TicketStatus::Completed,
            TicketStatus::Failed,
            TicketStatus::Skipped,
        ] {
            let parsed: TicketStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TicketStatus::Completed.is_terminal());
        assert!(TicketStatus::Failed.is_terminal());
        assert!(TicketStatus::Skipped.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
        assert!(!TicketStatus::Executing.is_terminal());
    }

    #[test]
    fn state_serializes_camel_case() {
        let state = State::new();
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("currentPhase").is_some());
        assert!(json.get("pauseRequested").is_some());
        assert_eq!(json["currentPhase"], "idle");
    }

    #[test]
    fn state_deserializes_without_pending_questions() {
        let json = r#"{
            "version": 1,
            "currentTicketId": "T1",
            "currentPhase": "executing",
            "sessionId": "sess-1",
            "pauseRequested": false,
            "startedAt": "2025-01-01T00:00:00Z",
            "lastUpdatedAt": "2025-01-01T00:05:00Z"
        }"#;
        let state: State = serde_json::from_str(json).unwrap();
        assert_eq!(state.current_phase, Phase::Executing);
        assert_eq!(state.current_ticket_id.as_deref(), Some("T1"));
        assert!(state.pending_questions.is_empty());
    }
}
