//! Pledge Checkout
//!
//! Client-side controller for a hosted secure payment widget:
//! - Requests a transaction secret (intent) from the backend
//! - Mounts exactly one provider widget bound to that secret
//! - Submits the tokenized payment at most once per session
//!
//! # Lifecycle Model
//!
//! - Every session runs under a monotonically increasing generation
//! - Every asynchronous callback is tagged with the generation it was issued
//!   under and dropped when that generation is no longer current
//! - Resets unmount the widget before advancing the generation
//! - The transaction secret lives in memory only and is never logged

pub mod audit_log;
pub mod config;
pub mod intent;
pub mod orchestrator;
pub mod reset;
pub mod session;
pub mod simulator;
pub mod submission;
pub mod widget;

mod error;

// Re-export commonly used types
pub use config::{Config, IntentEndpointConfig, SessionConfig, API_KEY_ENV, INTENT_URL_ENV};
pub use error::{
    ClassifiedError, Error, ErrorKind, Result, SessionError, SetupFailure, ValidationError,
};
pub use intent::{HttpIntentRequester, IntentRequester};
pub use orchestrator::{EventOutcome, NoopObserver, SessionObserver, SessionOrchestrator};
pub use session::{FailureKind, Generation, PaymentRequest, SessionStatus};
pub use submission::PreconditionFailure;
pub use widget::{WidgetProvider, WidgetSlot};
