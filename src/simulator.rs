//! In-process payment provider and backend
//!
//! Stand-ins for the hosted widget SDK and the intent endpoint that:
//! - Script widget events and confirm outcomes without a real processor
//! - Record every provider call, so mount/destroy ordering can be checked
//! - Support deferred replies for exercising superseded generations
//!
//! Used by the `simulate` CLI command and by the test suites.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{ClassifiedError, ErrorKind};
use crate::intent::{Intent, IntentError, IntentRequest, IntentRequester};
use crate::widget::{
    ConfirmOutcome, MountOptions, PaymentToken, WidgetEvent, WidgetEventHandler, WidgetProvider,
    WidgetRef, WidgetSlot,
};

/// How the simulated widget behaves once a handler is registered
#[derive(Debug, Clone, Default)]
pub struct ProviderScript {
    /// Emit `ready` as soon as a handler is attached
    pub auto_ready: bool,
    /// Emit `change` with this completeness after `ready`
    pub auto_complete: Option<bool>,
    /// Fail every mount with this error
    pub fail_mount: Option<ClassifiedError>,
    /// Hold `mount` open this long after the widget is created
    pub mount_delay: Option<Duration>,
}

impl ProviderScript {
    /// No automatic events; the caller emits them
    pub fn manual() -> Self {
        Self::default()
    }

    /// Widget becomes ready with complete, valid input
    pub fn filled_in() -> Self {
        Self {
            auto_ready: true,
            auto_complete: Some(true),
            ..Self::default()
        }
    }

    /// Widget becomes ready but the input stays incomplete
    pub fn incomplete() -> Self {
        Self {
            auto_ready: true,
            auto_complete: Some(false),
            ..Self::default()
        }
    }
}

/// Scripted reply to `confirm`
pub enum ConfirmReply {
    Outcome(ConfirmOutcome),
    Error(ClassifiedError),
    Deferred(oneshot::Receiver<ConfirmOutcome>),
}

/// Provider call log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Mount(String),
    Destroy(String),
    Tokenize(String),
    Confirm(String),
}

#[derive(Default)]
struct ProviderState {
    next_id: u64,
    live: HashMap<String, Option<WidgetEventHandler>>,
    latest: Option<String>,
    max_live: usize,
    calls: Vec<ProviderCall>,
    confirm_replies: VecDeque<ConfirmReply>,
    confirmations: u64,
}

/// Simulated secure widget SDK
pub struct SimulatedWidgetProvider {
    script: ProviderScript,
    state: Mutex<ProviderState>,
}

impl SimulatedWidgetProvider {
    pub fn new(script: ProviderScript) -> Self {
        Self {
            script,
            state: Mutex::new(ProviderState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        // A panic while holding the lock only happens inside a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the reply for the next `confirm` call
    pub fn queue_confirm(&self, reply: ConfirmReply) {
        self.state().confirm_replies.push_back(reply);
    }

    /// Emit an event from a live widget; returns false if it is not live
    pub fn emit(&self, widget_id: &str, event: WidgetEvent) -> bool {
        let handler = match self.state().live.get(widget_id) {
            Some(Some(handler)) => handler.clone(),
            _ => return false,
        };
        handler(event);
        true
    }

    /// Emit an event from the most recently mounted widget
    pub fn emit_latest(&self, event: WidgetEvent) -> bool {
        let latest = self.state().latest.clone();
        match latest {
            Some(id) => self.emit(&id, event),
            None => false,
        }
    }

    /// Simulate the provider tearing the widget down on its own
    pub fn destroy_from_provider(&self, widget_id: &str) -> bool {
        let handler = match self.state().live.remove(widget_id) {
            Some(handler) => handler,
            None => return false,
        };
        if let Some(handler) = handler {
            handler(WidgetEvent::Destroy);
        }
        true
    }

    pub fn latest_widget(&self) -> Option<String> {
        self.state().latest.clone()
    }

    pub fn live_widgets(&self) -> usize {
        self.state().live.len()
    }

    /// Highest number of simultaneously mounted widgets ever observed
    pub fn max_live_widgets(&self) -> usize {
        self.state().max_live
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    pub fn tokenize_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Tokenize(_)))
    }

    pub fn confirm_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Confirm(_)))
    }

    pub fn mount_calls(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Mount(_)))
    }

    fn count(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }
}

#[async_trait]
impl WidgetProvider for SimulatedWidgetProvider {
    async fn mount(
        &self,
        slot: &WidgetSlot,
        _options: MountOptions<'_>,
    ) -> Result<WidgetRef, ClassifiedError> {
        if let Some(err) = &self.script.fail_mount {
            return Err(err.clone());
        }

        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = format!("w{}", state.next_id);
            state.live.insert(id.clone(), None);
            state.latest = Some(id.clone());
            state.max_live = state.max_live.max(state.live.len());
            state.calls.push(ProviderCall::Mount(id.clone()));
            id
        };
        tracing::debug!(widget_id = %id, slot = %slot.0, "Simulated widget mounted");

        if let Some(delay) = self.script.mount_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(WidgetRef { id })
    }

    fn on(&self, widget: &WidgetRef, handler: WidgetEventHandler) {
        {
            let mut state = self.state();
            match state.live.get_mut(&widget.id) {
                Some(slot) => *slot = Some(handler.clone()),
                None => return,
            }
        }

        if self.script.auto_ready {
            handler(WidgetEvent::Ready);
        }
        if let Some(complete) = self.script.auto_complete {
            let error = (!complete)
                .then(|| ClassifiedError::incomplete("Your card number is incomplete."));
            handler(WidgetEvent::Change { complete, error });
        }
    }

    async fn tokenize(&self, widget: &WidgetRef) -> Result<PaymentToken, ClassifiedError> {
        let mut state = self.state();
        state.calls.push(ProviderCall::Tokenize(widget.id.clone()));
        if !state.live.contains_key(&widget.id) {
            return Err(ClassifiedError::new(
                ErrorKind::Processing,
                "widget is no longer mounted",
            ));
        }
        Ok(PaymentToken(format!("tok_{}", widget.id)))
    }

    async fn confirm(
        &self,
        _secret: &SecretString,
        token: &PaymentToken,
    ) -> Result<ConfirmOutcome, ClassifiedError> {
        let reply = {
            let mut state = self.state();
            state.calls.push(ProviderCall::Confirm(token.0.clone()));
            state.confirmations += 1;
            let n = state.confirmations;
            state
                .confirm_replies
                .pop_front()
                .unwrap_or_else(|| ConfirmReply::Outcome(ConfirmOutcome::succeeded(format!("conf_{}", n))))
        };

        match reply {
            ConfirmReply::Outcome(outcome) => Ok(outcome),
            ConfirmReply::Error(err) => Err(err),
            ConfirmReply::Deferred(rx) => rx.await.map_err(|_| {
                ClassifiedError::new(ErrorKind::Network, "confirmation abandoned")
            }),
        }
    }

    fn destroy(&self, widget: &WidgetRef) {
        let mut state = self.state();
        if state.live.remove(&widget.id).is_some() {
            state.calls.push(ProviderCall::Destroy(widget.id.clone()));
        }
    }
}

/// Scripted reply to an intent request
pub enum IntentReply {
    Ready(Result<(String, String), IntentError>),
    Deferred(oneshot::Receiver<Result<(String, String), IntentError>>),
}

impl IntentReply {
    pub fn secret(secret: impl Into<String>, attempt_id: impl Into<String>) -> Self {
        IntentReply::Ready(Ok((secret.into(), attempt_id.into())))
    }

    pub fn error(err: IntentError) -> Self {
        IntentReply::Ready(Err(err))
    }
}

#[derive(Default)]
struct BackendState {
    replies: VecDeque<IntentReply>,
    requests: Vec<IntentRequest>,
}

/// Simulated intent backend. Unscripted calls succeed with `sec_<n>`.
#[derive(Default)]
pub struct ScriptedIntentRequester {
    state: Mutex<BackendState>,
}

impl ScriptedIntentRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = IntentReply>) -> Self {
        let requester = Self::new();
        for reply in replies {
            requester.queue(reply);
        }
        requester
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn queue(&self, reply: IntentReply) {
        self.state().replies.push_back(reply);
    }

    /// Queue a reply that resolves when the returned sender fires
    pub fn queue_deferred(&self) -> oneshot::Sender<Result<(String, String), IntentError>> {
        let (tx, rx) = oneshot::channel();
        self.queue(IntentReply::Deferred(rx));
        tx
    }

    pub fn requests(&self) -> Vec<IntentRequest> {
        self.state().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().requests.len()
    }
}

#[async_trait]
impl IntentRequester for ScriptedIntentRequester {
    async fn create(&self, request: &IntentRequest) -> Result<Intent, IntentError> {
        let reply = {
            let mut state = self.state();
            state.requests.push(request.clone());
            let n = state.requests.len();
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| IntentReply::secret(format!("sec_{}", n), format!("att_{}", n)))
        };

        let resolved = match reply {
            IntentReply::Ready(result) => result,
            IntentReply::Deferred(rx) => rx
                .await
                .unwrap_or_else(|_| Err(IntentError::Network("request abandoned".to_string()))),
        };

        resolved.map(|(secret, attempt_id)| Intent {
            secret: SecretString::from(secret),
            attempt_id,
        })
    }
}
