//! Reset Controller
//!
//! Owns the generation counter. A reset always releases the mounted widget
//! first and only then advances the generation, so no two widgets are ever
//! mounted across a reset boundary.

use serde::Serialize;
use std::fmt;

use crate::session::{FailureKind, Generation, PaymentSession};
use crate::submission::SubmissionExecutor;
use crate::widget::WidgetBinder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "kind")]
pub enum ResetReason {
    /// Caller cancelled
    Cancel,
    /// Caller asked for a clean slate without cancelling
    Manual,
    /// Terminal failure
    Failure(FailureKind),
    /// Cleanup after a confirmed payment
    PostSuccess,
    /// `start()` while another session was pending
    Superseded,
    /// `retry()` from a failed session
    Retry,
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::Cancel => f.write_str("cancel"),
            ResetReason::Manual => f.write_str("manual"),
            ResetReason::Failure(FailureKind::Setup) => f.write_str("setup_failure"),
            ResetReason::Failure(FailureKind::Submission) => f.write_str("submission_failure"),
            ResetReason::PostSuccess => f.write_str("post_success"),
            ResetReason::Superseded => f.write_str("superseded"),
            ResetReason::Retry => f.write_str("retry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub reason: ResetReason,
    pub old_generation: Generation,
    pub new_generation: Generation,
    /// Generation of the widget released by this reset
    pub unmounted: Option<Generation>,
    /// Submission attempt whose result will now be ignored
    pub abandoned_attempt: Option<String>,
}

#[derive(Debug)]
pub struct ResetController {
    generation: Generation,
    resets: u64,
}

impl ResetController {
    pub fn new() -> Self {
        Self {
            generation: Generation::INITIAL,
            resets: 0,
        }
    }

    pub fn current(&self) -> Generation {
        self.generation
    }

    /// Number of resets performed so far
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Mint the next generation
    pub(crate) fn advance(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }

    /// Tear down widget and secret, then move to a fresh generation.
    ///
    /// The session keeps its request (so `retry()` can reuse it) but loses
    /// its secret; its status is left for the orchestrator to set.
    pub fn reset(
        &mut self,
        reason: ResetReason,
        binder: &mut WidgetBinder,
        executor: &mut SubmissionExecutor,
        session: &mut PaymentSession,
    ) -> ResetReport {
        let unmounted = binder.unmount();
        let abandoned_attempt = executor.clear().map(|a| a.attempt_id);
        session.secret = None;
        session.intent_attempt_id = None;

        let old_generation = self.generation;
        let new_generation = self.advance();
        session.generation = new_generation;
        self.resets += 1;

        tracing::info!(
            reason = %reason,
            old_generation = %old_generation,
            new_generation = %new_generation,
            unmounted = unmounted.is_some(),
            abandoned_attempt = ?abandoned_attempt,
            "Session reset"
        );

        ResetReport {
            reason,
            old_generation,
            new_generation,
            unmounted,
            abandoned_attempt,
        }
    }
}

impl Default for ResetController {
    fn default() -> Self {
        Self::new()
    }
}
