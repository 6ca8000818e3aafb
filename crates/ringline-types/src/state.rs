//! Call lifecycle states and the transition rules between them.
//!
//! Non-terminal states form an ordered progression:
//!
//! ```text
//! initiated < ringing < answered < active < { speaking, listening }
//! ```
//!
//! `speaking` and `listening` share a rank and may alternate freely. Every
//! terminal state is absorbing: once a call reaches one, it never moves again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Accepted locally, not yet acknowledged by the provider.
    Initiated,
    /// The destination phone is ringing.
    Ringing,
    /// The callee picked up.
    Answered,
    /// The media stream is connected.
    Active,
    /// The bot is playing synthesized speech.
    Speaking,
    /// The bot is waiting for the callee to talk.
    Listening,
    /// The provider reported a normal completion.
    Completed,
    /// The callee hung up.
    HangupUser,
    /// The bot ended the call.
    HangupBot,
    /// The call exceeded its allowed duration.
    Timeout,
    /// An internal error ended the call.
    Error,
    /// The provider could not place the call.
    Failed,
    /// Nobody answered.
    NoAnswer,
    /// The destination was busy.
    Busy,
}

impl CallState {
    /// Every state, non-terminal first. Handy for exhaustive tests.
    pub const ALL: [CallState; 14] = [
        Self::Initiated,
        Self::Ringing,
        Self::Answered,
        Self::Active,
        Self::Speaking,
        Self::Listening,
        Self::Completed,
        Self::HangupUser,
        Self::HangupBot,
        Self::Timeout,
        Self::Error,
        Self::Failed,
        Self::NoAnswer,
        Self::Busy,
    ];

    /// Returns `true` for absorbing end states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::HangupUser
                | Self::HangupBot
                | Self::Timeout
                | Self::Error
                | Self::Failed
                | Self::NoAnswer
                | Self::Busy
        )
    }

    /// Position in the non-terminal progression. Terminal states are unranked.
    fn ordinal(self) -> Option<u8> {
        match self {
            Self::Initiated => Some(0),
            Self::Ringing => Some(1),
            Self::Answered => Some(2),
            Self::Active => Some(3),
            Self::Speaking | Self::Listening => Some(4),
            _ => None,
        }
    }

    /// Reports whether a call in this state may move to `next`.
    ///
    /// - Nothing leaves a terminal state.
    /// - Any non-terminal state may end in any terminal state. This is lenient
    ///   on purpose: providers report `busy` or `no_answer` without always
    ///   reporting `ringing` first.
    /// - `speaking` and `listening` may alternate in either direction.
    /// - Otherwise the rank must strictly increase.
    pub fn can_transition_to(self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        if matches!(
            (self, next),
            (Self::Speaking, Self::Listening) | (Self::Listening, Self::Speaking)
        ) {
            return true;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    /// Returns the wire label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Active => "active",
            Self::Speaking => "speaking",
            Self::Listening => "listening",
            Self::Completed => "completed",
            Self::HangupUser => "hangup_user",
            Self::HangupBot => "hangup_bot",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::NoAnswer => "no_answer",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call state: {0}")]
pub struct ParseCallStateError(pub String);

impl FromStr for CallState {
    type Err = ParseCallStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseCallStateError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(from: CallState, to: CallState) -> bool {
        use CallState::*;
        if from.is_terminal() {
            return false;
        }
        if to.is_terminal() {
            return true;
        }
        let rank = |s: CallState| match s {
            Initiated => 0,
            Ringing => 1,
            Answered => 2,
            Active => 3,
            Speaking | Listening => 4,
            _ => unreachable!("terminal states are handled above"),
        };
        let cycle = matches!((from, to), (Speaking, Listening) | (Listening, Speaking));
        cycle || rank(to) > rank(from)
    }

    #[test]
    fn transition_table_is_exhaustively_correct() {
        for from in CallState::ALL {
            for to in CallState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    expected(from, to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for from in CallState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in CallState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn speaking_and_listening_alternate() {
        assert!(CallState::Speaking.can_transition_to(CallState::Listening));
        assert!(CallState::Listening.can_transition_to(CallState::Speaking));
        assert!(!CallState::Speaking.can_transition_to(CallState::Speaking));
        assert!(!CallState::Listening.can_transition_to(CallState::Active));
    }

    #[test]
    fn backwards_and_repeated_moves_are_rejected() {
        assert!(!CallState::Answered.can_transition_to(CallState::Ringing));
        assert!(!CallState::Active.can_transition_to(CallState::Initiated));
        assert!(!CallState::Ringing.can_transition_to(CallState::Ringing));
    }

    #[test]
    fn skipping_ahead_is_allowed() {
        assert!(CallState::Initiated.can_transition_to(CallState::Answered));
        assert!(CallState::Initiated.can_transition_to(CallState::Listening));
    }

    /// Known permissiveness: a call that never rang may still report `busy`.
    #[test]
    fn initiated_may_jump_to_any_terminal_state() {
        assert!(CallState::Initiated.can_transition_to(CallState::Busy));
        assert!(CallState::Initiated.can_transition_to(CallState::NoAnswer));
        assert!(CallState::Listening.can_transition_to(CallState::Failed));
    }

    #[test]
    fn labels_round_trip_through_from_str() {
        for state in CallState::ALL {
            assert_eq!(state.as_str().parse::<CallState>(), Ok(state));
        }
        assert!("in-progress".parse::<CallState>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_labels() {
        let json = serde_json::to_string(&CallState::HangupUser).unwrap();
        assert_eq!(json, "\"hangup_user\"");
        let parsed: CallState = serde_json::from_str("\"no_answer\"").unwrap();
        assert_eq!(parsed, CallState::NoAnswer);
    }
}
