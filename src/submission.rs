//! Submission Executor
//!
//! Runs the one-shot tokenize-then-confirm exchange. Preconditions are
//! checked synchronously and the attempt is marked in flight before the
//! exchange is spawned, so repeated `submit()` calls can never produce a
//! second confirm call for the same generation.

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorKind, LifecycleError};
use crate::session::{
    AttemptResult, Generation, PaymentSession, SessionEvent, SessionEventKind, SessionStatus,
    SubmissionAttempt,
};
use crate::widget::{ConfirmOutcome, ConfirmStatus, WidgetBinder};

/// Local reasons `submit()` refused to run. No external call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionFailure {
    #[error("a submission is already in flight")]
    AlreadyInFlight,

    #[error("session is {0}, not ready")]
    NotReady(SessionStatus),

    #[error("payment form is not ready yet")]
    WidgetNotReady,

    #[error("payment details are incomplete")]
    WidgetInvalid,

    #[error("no transaction secret is available")]
    MissingSecret,
}

pub struct SubmissionExecutor {
    current: Option<SubmissionAttempt>,
    timeout: Option<Duration>,
}

impl SubmissionExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            current: None,
            timeout,
        }
    }

    pub fn current(&self) -> Option<&SubmissionAttempt> {
        self.current.as_ref()
    }

    pub fn in_flight(&self) -> bool {
        self.current.as_ref().is_some_and(|a| a.in_flight)
    }

    /// Check every submit precondition without side effects
    pub fn check(
        &self,
        session: &PaymentSession,
        binder: &WidgetBinder,
    ) -> Result<(), PreconditionFailure> {
        if self.in_flight() {
            return Err(PreconditionFailure::AlreadyInFlight);
        }
        if session.status() != SessionStatus::Ready {
            return Err(PreconditionFailure::NotReady(session.status()));
        }
        if session.secret.is_none() {
            return Err(PreconditionFailure::MissingSecret);
        }

        let handle = binder
            .handle()
            .filter(|h| h.generation == session.generation())
            .ok_or(PreconditionFailure::WidgetNotReady)?;
        if !handle.ready {
            return Err(PreconditionFailure::WidgetNotReady);
        }
        if !handle.valid {
            return Err(PreconditionFailure::WidgetInvalid);
        }
        Ok(())
    }

    /// Start an attempt and spawn the exchange; its result arrives on `sink`.
    pub fn begin(
        &mut self,
        session: &PaymentSession,
        binder: &WidgetBinder,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<String, PreconditionFailure> {
        self.check(session, binder)?;

        let secret = session
            .secret
            .as_ref()
            .map(|s| SecretString::from(s.expose_secret().to_owned()))
            .ok_or(PreconditionFailure::MissingSecret)?;
        let exchange = binder
            .exchange(secret)
            .ok_or(PreconditionFailure::WidgetNotReady)?;

        let generation = session.generation();
        let attempt_id = Uuid::new_v4().to_string();
        self.current = Some(SubmissionAttempt {
            attempt_id: attempt_id.clone(),
            generation,
            in_flight: true,
            result: AttemptResult::Pending,
        });

        tracing::info!(
            generation = %generation,
            attempt_id = %attempt_id,
            "Submitting payment"
        );

        let timeout = self.timeout;
        let id = attempt_id.clone();
        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ClassifiedError::new(
                            ErrorKind::Network,
                            format!("confirmation timed out after {}ms", limit.as_millis()),
                        ))
                    }),
                None => exchange.await,
            };
            let _ = sink.send(SessionEvent {
                generation,
                kind: SessionEventKind::SubmissionResolved {
                    attempt_id: id,
                    result: classify(outcome),
                },
            });
        });

        Ok(attempt_id)
    }

    /// Settle the in-flight attempt matching `generation` and `attempt_id`.
    pub(crate) fn resolve(
        &mut self,
        generation: Generation,
        attempt_id: &str,
        result: AttemptResult,
    ) -> Result<AttemptResult, LifecycleError> {
        let attempt = self
            .current
            .as_mut()
            .filter(|a| a.in_flight && a.generation == generation && a.attempt_id == attempt_id)
            .ok_or_else(|| LifecycleError::UnknownAttempt(attempt_id.to_string()))?;
        if result == AttemptResult::Pending {
            return Err(LifecycleError::PendingResult(attempt_id.to_string()));
        }

        attempt.in_flight = false;
        attempt.result = result.clone();
        Ok(result)
    }

    /// Forget the current attempt. Returns it if it was still in flight.
    pub fn clear(&mut self) -> Option<SubmissionAttempt> {
        self.current.take().filter(|a| a.in_flight)
    }
}

/// Map the provider response onto an attempt result
fn classify(outcome: Result<ConfirmOutcome, ClassifiedError>) -> AttemptResult {
    match outcome {
        Ok(ConfirmOutcome {
            status: ConfirmStatus::Succeeded,
            confirmation_id: Some(confirmation_id),
            ..
        }) => AttemptResult::Success { confirmation_id },
        Ok(ConfirmOutcome {
            status: ConfirmStatus::Succeeded,
            confirmation_id: None,
            ..
        }) => AttemptResult::Failure(ClassifiedError::new(
            ErrorKind::Unknown,
            "provider reported success without a confirmation id",
        )),
        Ok(ConfirmOutcome {
            status: ConfirmStatus::Failed,
            error,
            ..
        }) => AttemptResult::Failure(
            error.unwrap_or_else(|| ClassifiedError::declined("payment was not confirmed")),
        ),
        Err(err) => AttemptResult::Failure(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WidgetStyle;
    use crate::simulator::{ProviderScript, SimulatedWidgetProvider};
    use crate::widget::{mount_now, WidgetEvent, WidgetSlot};
    use std::sync::Arc;

    async fn ready_fixture(
        script: ProviderScript,
    ) -> (
        Arc<SimulatedWidgetProvider>,
        WidgetBinder,
        PaymentSession,
        mpsc::UnboundedSender<SessionEvent>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let provider = Arc::new(SimulatedWidgetProvider::new(script));
        let mut binder = WidgetBinder::new(provider.clone(), WidgetStyle::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut session = PaymentSession::idle(Generation(1));
        session.secret = Some(SecretString::from("sec_1".to_string()));
        session.status = SessionStatus::Ready;

        mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(1),
            &SecretString::from("sec_1".to_string()),
            tx.clone(),
            &mut rx,
        )
        .await;
        while let Ok(event) = rx.try_recv() {
            if let SessionEventKind::Widget(widget_event) = event.kind {
                binder.apply(event.generation, widget_event).unwrap();
            }
        }
        (provider, binder, session, tx, rx)
    }

    #[tokio::test]
    async fn incomplete_input_is_rejected_locally() {
        let (provider, binder, session, tx, _rx) = ready_fixture(ProviderScript::incomplete()).await;
        let mut executor = SubmissionExecutor::new(None);

        let err = executor.begin(&session, &binder, tx).unwrap_err();
        assert_eq!(err, PreconditionFailure::WidgetInvalid);
        assert!(!executor.in_flight());
        assert_eq!(provider.tokenize_calls(), 0);
        assert_eq!(provider.confirm_calls(), 0);
    }

    #[tokio::test]
    async fn widget_must_be_ready() {
        let (_provider, mut binder, session, _tx, _rx) =
            ready_fixture(ProviderScript::manual()).await;
        let executor = SubmissionExecutor::new(None);
        assert_eq!(
            executor.check(&session, &binder),
            Err(PreconditionFailure::WidgetNotReady)
        );

        binder.apply(Generation(1), WidgetEvent::Ready).unwrap();
        assert_eq!(
            executor.check(&session, &binder),
            Err(PreconditionFailure::WidgetInvalid)
        );
    }

    #[tokio::test]
    async fn session_must_be_ready() {
        let (_provider, binder, mut session, _tx, _rx) =
            ready_fixture(ProviderScript::filled_in()).await;
        session.status = SessionStatus::AwaitingWidget;
        let executor = SubmissionExecutor::new(None);
        assert_eq!(
            executor.check(&session, &binder),
            Err(PreconditionFailure::NotReady(SessionStatus::AwaitingWidget))
        );
    }

    #[tokio::test]
    async fn second_begin_while_in_flight_is_rejected() {
        let (provider, binder, session, tx, mut rx) =
            ready_fixture(ProviderScript::filled_in()).await;
        let mut executor = SubmissionExecutor::new(None);

        let attempt_id = executor.begin(&session, &binder, tx.clone()).unwrap();
        assert_eq!(
            executor.begin(&session, &binder, tx),
            Err(PreconditionFailure::AlreadyInFlight)
        );

        let event = rx.recv().await.unwrap();
        let SessionEventKind::SubmissionResolved { attempt_id: id, result } = event.kind else {
            panic!("expected submission result");
        };
        assert_eq!(id, attempt_id);
        assert_eq!(
            executor.resolve(event.generation, &id, result).unwrap(),
            AttemptResult::Success {
                confirmation_id: "conf_1".to_string()
            }
        );
        assert!(!executor.in_flight());
        assert_eq!(provider.confirm_calls(), 1);
    }

    #[tokio::test]
    async fn confirm_timeout_is_a_failure() {
        let (provider, binder, session, tx, mut rx) =
            ready_fixture(ProviderScript::filled_in()).await;
        let (_hold, deferred) = tokio::sync::oneshot::channel();
        provider.queue_confirm(crate::simulator::ConfirmReply::Deferred(deferred));
        let mut executor = SubmissionExecutor::new(Some(Duration::from_millis(20)));

        executor.begin(&session, &binder, tx).unwrap();
        let event = rx.recv().await.unwrap();
        match event.kind {
            SessionEventKind::SubmissionResolved {
                result: AttemptResult::Failure(err),
                ..
            } => assert_eq!(err.kind, ErrorKind::Network),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_result_keeps_attempt_in_flight() {
        let (_provider, binder, session, tx, mut rx) =
            ready_fixture(ProviderScript::filled_in()).await;
        let mut executor = SubmissionExecutor::new(None);
        let attempt_id = executor.begin(&session, &binder, tx).unwrap();

        assert_eq!(
            executor.resolve(Generation(1), &attempt_id, AttemptResult::Pending),
            Err(LifecycleError::PendingResult(attempt_id.clone()))
        );
        assert!(executor.in_flight());

        let event = rx.recv().await.unwrap();
        let SessionEventKind::SubmissionResolved { result, .. } = event.kind else {
            panic!("expected submission result");
        };
        assert!(executor.resolve(Generation(1), &attempt_id, result).is_ok());
        assert!(!executor.in_flight());
    }

    #[test]
    fn resolve_ignores_unknown_attempts() {
        let mut executor = SubmissionExecutor::new(None);
        assert!(executor
            .resolve(Generation(1), "nope", AttemptResult::Pending)
            .is_err());
    }

    #[test]
    fn classify_provider_responses() {
        assert_eq!(
            classify(Ok(ConfirmOutcome::succeeded("conf_123"))),
            AttemptResult::Success {
                confirmation_id: "conf_123".to_string()
            }
        );
        assert!(matches!(
            classify(Ok(ConfirmOutcome::failed(ClassifiedError::declined("card declined")))),
            AttemptResult::Failure(ClassifiedError { kind: ErrorKind::Declined, .. })
        ));
        assert!(matches!(
            classify(Ok(ConfirmOutcome {
                status: ConfirmStatus::Succeeded,
                confirmation_id: None,
                error: None
            })),
            AttemptResult::Failure(_)
        ));
        assert!(matches!(
            classify(Err(ClassifiedError::new(ErrorKind::Network, "reset"))),
            AttemptResult::Failure(ClassifiedError { kind: ErrorKind::Network, .. })
        ));
    }
}
