//! Messages exchanged over the real-time observer channel.

use crate::types::{AttendanceRecord, PersonSummary};
use serde::{Deserialize, Serialize};

/// Which tables a bulk reset cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Persons and, with them, the ledger.
    Students,
    /// Ledger only; persons are kept.
    Attendance,
    All,
}

impl ResetScope {
    pub fn clears_persons(self) -> bool {
        !matches!(self, ResetScope::Attendance)
    }
}

impl std::fmt::Display for ResetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResetScope::Students => "students",
            ResetScope::Attendance => "attendance",
            ResetScope::All => "all",
        })
    }
}

/// State change pushed to every connected observer.
///
/// Wire format: `{"type": "<tag>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastEvent {
    StudentRegistered(PersonSummary),
    AttendanceMarked(AttendanceRecord),
    DatabaseReset { scope: ResetScope },
}

/// Inbound message from an observer. Anything unrecognised is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    #[serde(other)]
    Unknown,
}

/// Reply to [`ClientMessage::Ping`].
pub const PONG: &str = r#"{"type":"pong"}"#;
