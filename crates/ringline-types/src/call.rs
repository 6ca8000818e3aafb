//! Call records, transcript turns, and normalized provider events.

use crate::state::CallState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a call interacts with the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// One-way announcement, then hang up.
    #[default]
    Notify,
    /// Two-way dialogue over a live media stream.
    Conversation,
}

impl CallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::Conversation => "conversation",
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallMode {
    type Err = crate::CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "notify" => Ok(Self::Notify),
            "conversation" => Ok(Self::Conversation),
            other => Err(crate::CallError::InvalidInput(format!(
                "unsupported call mode '{}': expected 'notify' or 'conversation'",
                other
            ))),
        }
    }
}

/// Who spoke a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Bot,
    User,
}

/// One utterance in a call transcript. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnEntry {
    pub role: TurnRole,
    pub text: String,
    /// When the turn was spoken. The Unix epoch means "not yet stamped";
    /// the call store fills it in on append.
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

impl TurnEntry {
    /// Creates an unstamped turn.
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: DateTime::<Utc>::default(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Bot, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, text)
    }

    /// Returns `true` if the store has not stamped this turn yet.
    pub fn is_unstamped(&self) -> bool {
        self.timestamp == DateTime::<Utc>::default()
    }
}

/// The full state of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Internal call identifier.
    pub call_id: String,
    /// The telephony provider's identifier for this call leg.
    #[serde(default)]
    pub provider_call_id: Option<String>,
    pub to: String,
    pub from: String,
    pub mode: CallMode,
    pub state: CallState,
    #[serde(default)]
    pub transcript: Vec<TurnEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock length of the call in milliseconds, set once it ends.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl CallRecord {
    /// Builds a fresh record in the `initiated` state. Timestamps are stamped
    /// by the call store on creation.
    pub fn new(
        call_id: impl Into<String>,
        to: impl Into<String>,
        from: impl Into<String>,
        mode: CallMode,
    ) -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            call_id: call_id.into(),
            provider_call_id: None,
            to: to.into(),
            from: from.into(),
            mode,
            state: CallState::Initiated,
            transcript: Vec::new(),
            created_at: epoch,
            updated_at: epoch,
            ended_at: None,
            duration_ms: None,
            error_detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Text of the first bot turn, used as the greeting of a conversation.
    pub fn greeting(&self) -> Option<&str> {
        self.transcript
            .first()
            .filter(|turn| turn.role == TurnRole::Bot)
            .map(|turn| turn.text.as_str())
    }
}

/// A provider callback normalized into a state change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    /// The provider's call identifier, if the payload carried one.
    #[serde(default)]
    pub provider_call_id: String,
    /// Our internal call ID, echoed back through the callback URL.
    #[serde(default)]
    pub call_id: String,
    /// Provider event category, e.g. `status`.
    pub event_type: String,
    pub status: CallState,
    #[serde(default)]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_mode_parses_known_values() {
        assert_eq!("notify".parse::<CallMode>().unwrap(), CallMode::Notify);
        assert_eq!(
            " conversation ".parse::<CallMode>().unwrap(),
            CallMode::Conversation
        );
        let err = "broadcast".parse::<CallMode>().unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn new_record_starts_initiated_and_unended() {
        let record = CallRecord::new("c-1", "+14155551234", "+14155550000", CallMode::Notify);
        assert_eq!(record.state, CallState::Initiated);
        assert!(record.transcript.is_empty());
        assert!(record.ended_at.is_none());
        assert!(record.duration_ms.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn greeting_is_first_bot_turn_only() {
        let mut record = CallRecord::new("c-1", "+1", "+2", CallMode::Conversation);
        assert_eq!(record.greeting(), None);
        record.transcript.push(TurnEntry::user("hi"));
        assert_eq!(record.greeting(), None);
        record.transcript.insert(0, TurnEntry::bot("Hello there"));
        assert_eq!(record.greeting(), Some("Hello there"));
    }

    #[test]
    fn fresh_turns_are_unstamped() {
        let turn = TurnEntry::bot("hi");
        assert!(turn.is_unstamped());
        let stamped = TurnEntry {
            timestamp: Utc::now(),
            ..turn
        };
        assert!(!stamped.is_unstamped());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = CallRecord::new("c-9", "+1", "+2", CallMode::Conversation);
        record.provider_call_id = Some("CA123".to_string());
        record.transcript.push(TurnEntry::user("yes"));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"mode\":\"conversation\""));
        let back: CallRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
