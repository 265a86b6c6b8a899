//! Error types for the payment session controller

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::intent::IntentError;
use crate::session::{Generation, SessionStatus};
use crate::submission::PreconditionFailure;

/// Crate-level error used by configuration loading, the CLI and transport setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Provider-side error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Declined,
    Incomplete,
    InvalidInput,
    Processing,
    Network,
    Server,
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Declined => "declined",
            ErrorKind::Incomplete => "incomplete",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Processing => "processing",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error as classified by the payment provider or the widget.
///
/// Deserializes from the provider's `{ "kind": "declined", "message": "..." }`
/// shape; `message` may be omitted.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Declined, message)
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Incomplete, message)
    }
}

/// Synchronous rejections from `start()`. These never reach the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount {amount} is outside the allowed range [{min}, {max}]")]
    AmountOutOfBounds { amount: u64, min: u64, max: u64 },

    #[error("currency {0:?} is not accepted")]
    UnsupportedCurrency(String),

    #[error("recipient id must not be empty")]
    MissingRecipient,
}

/// Failure modes surfaced by the session orchestrator.
///
/// `Setup` and `Submission` are terminal for the current generation and
/// reach the caller through `SessionObserver::on_error`. `Widget` stays
/// inside the binder and is only exposed for inline display.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("setup failed: {0}")]
    Setup(SetupFailure),

    #[error("widget reported: {0}")]
    Widget(ClassifiedError),

    #[error("submission failed: {0}")]
    Submission(ClassifiedError),

    #[error("cannot submit: {0}")]
    Precondition(#[from] PreconditionFailure),

    #[error("{operation} is not allowed while {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("no Tokio runtime is available to drive the session")]
    RuntimeUnavailable,
}

impl SessionError {
    /// Short message suitable for showing to the payer.
    pub fn classified_message(&self) -> String {
        match self {
            SessionError::Validation(err) => err.to_string(),
            SessionError::Setup(SetupFailure::Intent(IntentError::Network(_))) => {
                "Could not reach the payment service. Please try again.".to_string()
            }
            SessionError::Setup(_) => "The payment form could not be prepared.".to_string(),
            SessionError::Widget(err) | SessionError::Submission(err) => match err.kind {
                ErrorKind::Declined => "Your payment was declined.".to_string(),
                _ if !err.message.is_empty() => err.message.clone(),
                kind => format!("Payment failed ({kind})."),
            },
            SessionError::Precondition(failure) => failure.to_string(),
            SessionError::InvalidState { .. } | SessionError::RuntimeUnavailable => {
                self.to_string()
            }
        }
    }
}

/// Why a session could not reach the `Ready` state.
#[derive(Error, Debug, Clone)]
pub enum SetupFailure {
    #[error("{0}")]
    Intent(#[from] IntentError),

    #[error("widget mount failed: {0}")]
    Mount(ClassifiedError),

    #[error("widget was destroyed by the provider")]
    WidgetDestroyed,
}

/// A callback that arrived for a superseded generation or after teardown.
///
/// Internal only: these are dropped and logged at debug level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleError {
    #[error("callback for generation {received} arrived while {current} is current")]
    StaleGeneration {
        received: Generation,
        current: Generation,
    },

    #[error("no widget is mounted for generation {0}")]
    NotMounted(Generation),

    #[error("callback does not apply while {0}")]
    UnexpectedStatus(SessionStatus),

    #[error("no submission attempt {0} is in flight")]
    UnknownAttempt(String),

    #[error("submission attempt {0} resolved without a result")]
    PendingResult(String),
}
