//! Payment session data model
//!
//! A session is one end-to-end attempt to move funds to a recipient. Every
//! session, and every asynchronous callback issued on its behalf, carries the
//! [`Generation`] it was created under so that late results from a superseded
//! attempt can be recognised and dropped.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ClassifiedError;
use crate::intent::{Intent, IntentError};
use crate::widget::{WidgetEvent, WidgetRef};

/// Monotonically increasing token distinguishing successive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// What the caller asked to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Amount in minor currency units
    pub amount: u64,
    /// ISO 4217 code, upper case
    pub currency: String,
    pub recipient_id: String,
}

/// Which stage a terminal failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Setup,
    Submission,
}

/// Orchestrator state machine.
///
/// `Idle` and `Succeeded` are the only states with no user-visible
/// transaction pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum SessionStatus {
    Idle,
    CreatingIntent,
    AwaitingWidget,
    Ready,
    Submitting,
    Succeeded,
    Failed(FailureKind),
}

impl SessionStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionStatus::Failed(_))
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::CreatingIntent => f.write_str("creating_intent"),
            SessionStatus::AwaitingWidget => f.write_str("awaiting_widget"),
            SessionStatus::Ready => f.write_str("ready"),
            SessionStatus::Submitting => f.write_str("submitting"),
            SessionStatus::Succeeded => f.write_str("succeeded"),
            SessionStatus::Failed(FailureKind::Setup) => f.write_str("failed(setup)"),
            SessionStatus::Failed(FailureKind::Submission) => f.write_str("failed(submission)"),
        }
    }
}

/// The single current session of an orchestrator.
///
/// The secret is never serialized and is redacted from `Debug` output.
pub struct PaymentSession {
    pub(crate) generation: Generation,
    pub(crate) secret: Option<SecretString>,
    pub(crate) intent_attempt_id: Option<String>,
    pub(crate) request: Option<PaymentRequest>,
    pub(crate) status: SessionStatus,
}

impl PaymentSession {
    pub(crate) fn idle(generation: Generation) -> Self {
        Self {
            generation,
            secret: None,
            intent_attempt_id: None,
            request: None,
            status: SessionStatus::Idle,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn request(&self) -> Option<&PaymentRequest> {
        self.request.as_ref()
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Backend attempt id returned alongside the secret.
    pub fn intent_attempt_id(&self) -> Option<&str> {
        self.intent_attempt_id.as_deref()
    }
}

impl fmt::Debug for PaymentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentSession")
            .field("generation", &self.generation)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("intent_attempt_id", &self.intent_attempt_id)
            .field("request", &self.request)
            .field("status", &self.status)
            .finish()
    }
}

/// Outcome of a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Pending,
    Success { confirmation_id: String },
    Failure(ClassifiedError),
}

/// One `submit()` call. Lives until it resolves or its generation is reset.
#[derive(Debug, Clone)]
pub struct SubmissionAttempt {
    pub attempt_id: String,
    pub generation: Generation,
    pub in_flight: bool,
    pub result: AttemptResult,
}

/// Asynchronous callback delivered to the orchestrator.
#[derive(Debug)]
pub struct SessionEvent {
    /// Generation the originating call was issued under
    pub generation: Generation,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    IntentResolved(std::result::Result<Intent, IntentError>),
    /// A mount started for this generation has settled
    WidgetMounted(std::result::Result<WidgetRef, ClassifiedError>),
    Widget(WidgetEvent),
    SubmissionResolved {
        attempt_id: String,
        result: AttemptResult,
    },
}

impl SessionEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEventKind::IntentResolved(_) => "intent_resolved",
            SessionEventKind::WidgetMounted(_) => "widget_mounted",
            SessionEventKind::Widget(WidgetEvent::Ready) => "widget_ready",
            SessionEventKind::Widget(WidgetEvent::Change { .. }) => "widget_change",
            SessionEventKind::Widget(WidgetEvent::Destroy) => "widget_destroy",
            SessionEventKind::SubmissionResolved { .. } => "submission_resolved",
        }
    }
}
