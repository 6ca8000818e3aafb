//! The authoritative in-memory call store.
//!
//! [`CallStore`] owns every [`CallRecord`](ringline_types::CallRecord). All
//! state changes pass through the call state machine, and transcript
//! appends wake any task blocked in [`CallStore::wait_for_transcript`].
//!
//! Records are mirrored to a [`CallPersistence`] sink after each change.
//! The sink is write-behind: its failures are logged and never surface to
//! callers. [`JsonlCallLog`] is the file-backed sink.

mod error;
mod log;
mod store;

pub use error::StoreError;
pub use log::{CallPersistence, JsonlCallLog};
pub use store::{CallStore, ORPHANED_DETAIL};

#[cfg(test)]
mod tests;
