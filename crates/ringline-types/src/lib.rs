//! Shared types for the ringline call engine.
//!
//! This crate holds the call state machine, the call record data model, the
//! normalized provider event type, and the user-facing error taxonomy. Every
//! other ringline crate depends on it; it depends on nothing internal.

mod call;
mod error;
mod state;

pub use call::{CallEvent, CallMode, CallRecord, TurnEntry, TurnRole};
pub use error::CallError;
pub use state::{CallState, ParseCallStateError};
