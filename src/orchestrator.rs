//! Session Orchestrator
//!
//! Top-level state machine for one payment session at a time:
//!
//! ```text
//! Idle -> CreatingIntent -> AwaitingWidget -> Ready -> Submitting -> Succeeded
//!              |                  |                        |
//!              +------------------+------------------------+--> Failed(kind)
//! ```
//!
//! Provider and network calls (intent creation, widget mount, tokenize and
//! confirm) run on spawned tasks that report back through a channel. Every
//! report carries the generation it was issued under and is dropped without
//! side effects when that generation is no longer current. Applying a report
//! never awaits, so dropping a `pump()` future loses nothing.
//!
//! Terminal outcomes (success or failure) tear the widget down and advance
//! the generation right away; the status is then parked on `Succeeded` or
//! `Failed` until the caller starts again, retries or cancels.

use secrecy::ExposeSecret;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audit_log::{AuditEntry, AuditLog};
use crate::config::SessionConfig;
use crate::error::{ClassifiedError, LifecycleError, SessionError, SetupFailure};
use crate::intent::{Intent, IntentError, IntentRequest, IntentRequester};
use crate::reset::{ResetController, ResetReason, ResetReport};
use crate::session::{
    AttemptResult, FailureKind, Generation, PaymentRequest, PaymentSession, SessionEvent,
    SessionEventKind, SessionStatus, SubmissionAttempt,
};
use crate::submission::SubmissionExecutor;
use crate::widget::{
    MountSettlement, WidgetBinder, WidgetEvent, WidgetHandle, WidgetProvider, WidgetRef,
    WidgetSignal, WidgetSlot,
};

/// Caller-facing callbacks. Only the orchestrator invokes these.
pub trait SessionObserver: Send + Sync {
    fn on_success(&self, confirmation_id: &str);
    fn on_error(&self, error: &SessionError);
    fn on_cancel(&self);
}

/// Observer that ignores every callback
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_success(&self, _confirmation_id: &str) {}
    fn on_error(&self, _error: &SessionError) {}
    fn on_cancel(&self) {}
}

/// What applying a callback did with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Stale or inapplicable; state is untouched
    Discarded,
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    requester: Arc<dyn IntentRequester>,
    binder: WidgetBinder,
    executor: SubmissionExecutor,
    resetter: ResetController,
    session: PaymentSession,
    slot: WidgetSlot,
    observer: Arc<dyn SessionObserver>,
    audit: Option<AuditLog>,
    last_error: Option<SessionError>,
    discarded: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionOrchestrator {
    /// Operations that start work (`start`, `retry`, `submit`) spawn Tokio
    /// tasks; called outside a runtime they return
    /// [`SessionError::RuntimeUnavailable`] and change nothing.
    pub fn new(
        config: SessionConfig,
        requester: Arc<dyn IntentRequester>,
        provider: Arc<dyn WidgetProvider>,
        slot: WidgetSlot,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let resetter = ResetController::new();
        let session = PaymentSession::idle(resetter.current());
        Self {
            binder: WidgetBinder::new(provider, config.widget.clone()),
            executor: SubmissionExecutor::new(config.timeouts.confirm()),
            config,
            requester,
            resetter,
            session,
            slot,
            observer: Arc::new(NoopObserver),
            audit: None,
            last_error: None,
            discarded: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn generation(&self) -> Generation {
        self.session.generation
    }

    pub fn session(&self) -> &PaymentSession {
        &self.session
    }

    pub fn widget(&self) -> Option<&WidgetHandle> {
        self.binder.handle()
    }

    /// Inline widget error to display next to the form, if any
    pub fn widget_error(&self) -> Option<&ClassifiedError> {
        self.binder.handle().and_then(|h| h.last_error.as_ref())
    }

    pub fn submission(&self) -> Option<&SubmissionAttempt> {
        self.executor.current()
    }

    /// The terminal error behind the current `Failed` status
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Number of callbacks dropped as stale or inapplicable
    pub fn discarded_events(&self) -> u64 {
        self.discarded
    }

    /// `secret ∧ ready ∧ valid ∧ ¬inFlight`
    pub fn can_submit(&self) -> bool {
        self.executor.check(&self.session, &self.binder).is_ok()
    }

    /// Begin a new session. Any pending session is torn down first.
    pub fn start(
        &mut self,
        amount: u64,
        recipient_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Result<Generation, SessionError> {
        let request = PaymentRequest {
            amount,
            currency: currency.into().to_ascii_uppercase(),
            recipient_id: recipient_id.into(),
        };
        self.config.validate(&request)?;
        ensure_runtime()?;
        Ok(self.begin(request))
    }

    /// Abandon the current session. No-op when idle; after a confirmed
    /// payment it only clears the parked status, without `on_cancel`.
    pub fn cancel(&mut self) {
        match self.session.status {
            SessionStatus::Idle => {}
            SessionStatus::Succeeded => {
                self.session.status = SessionStatus::Idle;
                self.session.request = None;
            }
            _ => {
                self.reset_to_idle(ResetReason::Cancel);
                self.observer.on_cancel();
            }
        }
    }

    /// Start over with the same request after a terminal failure
    pub fn retry(&mut self) -> Result<Generation, SessionError> {
        let request = match (&self.session.status, &self.session.request) {
            (SessionStatus::Failed(_), Some(request)) => request.clone(),
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "retry",
                    status: self.session.status,
                })
            }
        };
        ensure_runtime()?;
        self.reset_to_idle(ResetReason::Retry);
        Ok(self.begin(request))
    }

    /// Tear everything down and return to `Idle` without notifying the caller.
    pub fn reset(&mut self) -> Option<ResetReport> {
        if self.session.status == SessionStatus::Idle {
            return None;
        }
        Some(self.reset_to_idle(ResetReason::Manual))
    }

    /// Submit the payment. Preconditions are checked before anything is
    /// spawned; on success the returned attempt id identifies the exchange.
    pub fn submit(&mut self) -> Result<String, SessionError> {
        ensure_runtime()?;
        let attempt_id = self
            .executor
            .begin(&self.session, &self.binder, self.events_tx.clone())?;
        self.session.status = SessionStatus::Submitting;
        self.audit(
            "submission_started",
            json!({ "attempt_id": attempt_id }),
        );
        Ok(attempt_id)
    }

    /// Wait for the next callback and apply it
    pub async fn pump(&mut self) -> Option<EventOutcome> {
        let event = self.events_rx.recv().await?;
        Some(self.handle_event(event))
    }

    /// Apply callbacks until `done` holds for the current status
    pub async fn run_until(&mut self, done: impl Fn(SessionStatus) -> bool) -> SessionStatus {
        while !done(self.session.status) {
            if self.pump().await.is_none() {
                break;
            }
        }
        self.session.status
    }

    /// Apply every callback that is ready without waiting for new ones
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            tokio::task::yield_now().await;
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    /// Apply one callback. Callbacks from a superseded generation, or ones
    /// that do not fit the current status, are dropped.
    pub(crate) fn handle_event(&mut self, event: SessionEvent) -> EventOutcome {
        let name = event.kind.name();
        let generation = event.generation;
        let stale = LifecycleError::StaleGeneration {
            received: generation,
            current: self.session.generation,
        };

        let result = match event.kind {
            // Settled even when stale, so an unwanted widget is destroyed
            SessionEventKind::WidgetMounted(result) => self.on_widget_mounted(generation, result),
            _ if generation != self.session.generation => Err(stale),
            SessionEventKind::IntentResolved(result) => self.on_intent(generation, result),
            SessionEventKind::Widget(widget_event) => {
                self.on_widget_event(generation, widget_event)
            }
            SessionEventKind::SubmissionResolved { attempt_id, result } => {
                self.on_submission(generation, &attempt_id, result)
            }
        };

        match result {
            Ok(()) => EventOutcome::Applied,
            Err(reason) => {
                self.discarded += 1;
                tracing::debug!(
                    event = name,
                    generation = %generation,
                    reason = %reason,
                    "Discarded session callback"
                );
                self.audit(
                    "callback_discarded",
                    json!({
                        "event": name,
                        "event_generation": generation.0,
                        "reason": reason.to_string(),
                        "discarded_total": self.discarded,
                    }),
                );
                EventOutcome::Discarded
            }
        }
    }

    fn begin(&mut self, request: PaymentRequest) -> Generation {
        if self.session.status != SessionStatus::Idle {
            self.reset_to_idle(ResetReason::Superseded);
        }
        self.last_error = None;

        let generation = self.resetter.advance();
        let intent_request = IntentRequest::from_payment(&request)
            .with_metadata("generation", generation.0.to_string());
        self.session = PaymentSession::idle(generation);
        self.session.request = Some(request);
        self.session.status = SessionStatus::CreatingIntent;

        let requester = self.requester.clone();
        let sink = self.events_tx.clone();
        let timeout = self.config.timeouts.intent();
        tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, requester.create(&intent_request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(IntentError::Network(format!(
                            "intent request timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => requester.create(&intent_request).await,
            };
            // The receiver is gone once the orchestrator is dropped
            let _ = sink.send(SessionEvent {
                generation,
                kind: SessionEventKind::IntentResolved(result),
            });
        });

        if let Some(request) = &self.session.request {
            tracing::info!(
                generation = %generation,
                amount = request.amount,
                currency = %request.currency,
                recipient_id = %request.recipient_id,
                "Payment session started"
            );
            let details = json!({
                "amount": request.amount,
                "currency": request.currency,
                "recipient_id": request.recipient_id,
            });
            self.audit("session_started", details);
        }
        generation
    }

    fn on_intent(
        &mut self,
        generation: Generation,
        result: Result<Intent, IntentError>,
    ) -> Result<(), LifecycleError> {
        if self.session.status != SessionStatus::CreatingIntent {
            return Err(LifecycleError::UnexpectedStatus(self.session.status));
        }

        let intent = match result {
            Ok(intent) => intent,
            Err(err) => {
                self.fail(
                    FailureKind::Setup,
                    SessionError::Setup(SetupFailure::Intent(err)),
                );
                return Ok(());
            }
        };

        tracing::info!(
            generation = %generation,
            intent_attempt_id = %intent.attempt_id,
            "Intent resolved"
        );
        self.audit(
            "intent_resolved",
            json!({ "intent_attempt_id": intent.attempt_id }),
        );
        self.session.intent_attempt_id = Some(intent.attempt_id);
        self.session.status = SessionStatus::AwaitingWidget;

        let requested = self.binder.request_mount(
            &self.slot,
            generation,
            &intent.secret,
            self.events_tx.clone(),
        );
        self.session.secret = Some(intent.secret);
        if let Err(err) = requested {
            self.fail(
                FailureKind::Setup,
                SessionError::Setup(SetupFailure::Mount(err)),
            );
        }
        Ok(())
    }

    fn on_widget_mounted(
        &mut self,
        generation: Generation,
        result: Result<WidgetRef, ClassifiedError>,
    ) -> Result<(), LifecycleError> {
        let current = generation == self.session.generation;
        let accept = current && self.session.status == SessionStatus::AwaitingWidget;

        match self.binder.settle_mount(generation, result, accept) {
            MountSettlement::Attached => {
                self.audit("widget_mounted", json!({ "slot": self.slot.0 }));
                Ok(())
            }
            MountSettlement::Failed(err) => {
                self.fail(
                    FailureKind::Setup,
                    SessionError::Setup(SetupFailure::Mount(err)),
                );
                Ok(())
            }
            MountSettlement::Released if !current => Err(LifecycleError::StaleGeneration {
                received: generation,
                current: self.session.generation,
            }),
            MountSettlement::Released => {
                Err(LifecycleError::UnexpectedStatus(self.session.status))
            }
        }
    }

    fn on_widget_event(
        &mut self,
        generation: Generation,
        event: WidgetEvent,
    ) -> Result<(), LifecycleError> {
        match self.binder.apply(generation, event)? {
            WidgetSignal::Ready => {
                if self.session.status == SessionStatus::AwaitingWidget {
                    self.session.status = SessionStatus::Ready;
                    tracing::info!(generation = %generation, "Secure widget ready");
                    self.audit("widget_ready", json!({}));
                }
            }
            WidgetSignal::Changed { valid, error } => match error {
                // Shown inline; the payer keeps editing the same widget
                Some(err) => tracing::debug!(
                    generation = %generation,
                    error = %SessionError::Widget(err),
                    "Widget input invalid"
                ),
                None => tracing::debug!(generation = %generation, valid, "Widget input changed"),
            },
            WidgetSignal::Destroyed => match self.session.status {
                SessionStatus::AwaitingWidget | SessionStatus::Ready => self.fail(
                    FailureKind::Setup,
                    SessionError::Setup(SetupFailure::WidgetDestroyed),
                ),
                status => tracing::warn!(
                    generation = %generation,
                    status = %status,
                    "Widget destroyed by provider while submitting"
                ),
            },
        }
        Ok(())
    }

    fn on_submission(
        &mut self,
        generation: Generation,
        attempt_id: &str,
        result: AttemptResult,
    ) -> Result<(), LifecycleError> {
        match self.executor.resolve(generation, attempt_id, result)? {
            AttemptResult::Success { confirmation_id } => {
                self.resetter.reset(
                    ResetReason::PostSuccess,
                    &mut self.binder,
                    &mut self.executor,
                    &mut self.session,
                );
                self.session.status = SessionStatus::Succeeded;
                tracing::info!(
                    generation = %generation,
                    attempt_id = %attempt_id,
                    confirmation_id = %confirmation_id,
                    "Payment confirmed"
                );
                self.audit(
                    "session_succeeded",
                    json!({ "attempt_id": attempt_id, "confirmation_id": confirmation_id }),
                );
                self.observer.on_success(&confirmation_id);
            }
            AttemptResult::Failure(err) => {
                self.fail(FailureKind::Submission, SessionError::Submission(err))
            }
            // `resolve` never settles an attempt as pending
            AttemptResult::Pending => {}
        }
        Ok(())
    }

    /// Terminal failure: tear down, park on `Failed`, tell the caller once.
    fn fail(&mut self, kind: FailureKind, error: SessionError) {
        let failed_generation = self.session.generation;
        self.resetter.reset(
            ResetReason::Failure(kind),
            &mut self.binder,
            &mut self.executor,
            &mut self.session,
        );
        self.session.status = SessionStatus::Failed(kind);

        tracing::warn!(
            generation = %failed_generation,
            error = %error,
            "Payment session failed"
        );
        self.audit(
            "session_failed",
            json!({
                "failed_generation": failed_generation.0,
                "error": error.to_string(),
            }),
        );
        self.last_error = Some(error.clone());
        self.observer.on_error(&error);
    }

    fn reset_to_idle(&mut self, reason: ResetReason) -> ResetReport {
        let report = self.resetter.reset(
            reason,
            &mut self.binder,
            &mut self.executor,
            &mut self.session,
        );
        self.session.status = SessionStatus::Idle;
        if reason != ResetReason::Retry {
            self.session.request = None;
        }
        self.last_error = None;
        self.audit("session_reset", json!(report));
        report
    }

    fn audit(&self, entry_type: &'static str, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEntry::new(
                entry_type,
                self.session.generation,
                self.session.status,
                details,
            ));
        }
    }
}

fn ensure_runtime() -> Result<(), SessionError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| SessionError::RuntimeUnavailable)
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session", &self.session)
            .field("widget", &self.binder.handle())
            .field("submission", &self.executor.current())
            .field("discarded", &self.discarded)
            .finish()
    }
}

/// Secret-free snapshot of the session for rendering
pub fn describe(orchestrator: &SessionOrchestrator) -> serde_json::Value {
    let session = orchestrator.session();
    json!({
        "generation": session.generation().0,
        "status": session.status(),
        "has_secret": session.secret.as_ref().map(|s| !s.expose_secret().is_empty()).unwrap_or(false),
        "request": session.request(),
        "widget": orchestrator.widget().map(|w| json!({
            "ready": w.ready,
            "valid": w.valid,
            "error": w.last_error.as_ref().map(|e| e.to_string()),
        })),
        "can_submit": orchestrator.can_submit(),
        "last_error": orchestrator.last_error().map(|e| e.classified_message()),
    })
}
