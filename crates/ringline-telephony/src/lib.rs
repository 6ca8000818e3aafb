//! Telephony provider adapters for ringline.
//!
//! [`CallBackend`] is the port the call engine drives: place and hang up
//! calls, play an announcement, and authenticate and parse the provider's
//! webhooks. Two implementations ship here:
//!
//! - [`TwilioBackend`] speaks a Twilio-style REST API with inline TwiML.
//! - [`MockBackend`] records what it was asked to do, for tests and local runs.

mod backend;
mod error;
mod mock;
pub mod signature;
mod twilio;

pub use backend::{
    CallBackend, InitiateCallRequest, InitiateCallResponse, ParsedWebhook, WebhookRequest,
    WebhookResponse,
};
pub use error::TelephonyError;
pub use mock::MockBackend;
pub use signature::{SIGNATURE_HEADER, TWILIO_SIGNATURE_HEADER};
pub use twilio::{map_twilio_status, TwilioBackend, TwilioConfig, DEFAULT_API_BASE_URL};
