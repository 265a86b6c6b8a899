//! Secure Widget Binder
//!
//! Sole owner and mutator of the provider widget instance. At most one
//! instance is mounted at any time:
//! - provider `mount` calls run on a task and settle through the session
//!   channel, so dropping a caller's future never strands a widget
//! - a new mount waits until the previous mount call has settled
//! - a settled mount nobody wants any more is destroyed immediately
//! - `unmount` detaches the handler and destroys the instance before returning

use futures::future::BoxFuture;
use futures::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    ConfirmOutcome, MountOptions, WidgetEvent, WidgetHandle, WidgetProvider, WidgetRef,
    WidgetSlot,
};
use crate::config::WidgetStyle;
use crate::error::{ClassifiedError, ErrorKind, LifecycleError};
use crate::session::{Generation, SessionEvent, SessionEventKind};

/// What a widget event changed, as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetSignal {
    Ready,
    Changed {
        valid: bool,
        error: Option<ClassifiedError>,
    },
    Destroyed,
}

/// How a settled mount call was folded into the binder
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MountSettlement {
    /// Recorded as the live widget; its events now reach the session
    Attached,
    /// The provider refused to mount
    Failed(ClassifiedError),
    /// Not wanted any more; destroyed if the provider created it
    Released,
}

struct MountedWidget {
    widget: WidgetRef,
    handle: WidgetHandle,
    /// Cleared on unmount so a provider that keeps calling a dropped
    /// handler cannot reach the orchestrator
    attached: Arc<AtomicBool>,
}

struct MountRequest {
    slot: WidgetSlot,
    generation: Generation,
    secret: SecretString,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

struct PendingMount {
    generation: Generation,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

pub struct WidgetBinder {
    provider: Arc<dyn WidgetProvider>,
    style: WidgetStyle,
    mounted: Option<MountedWidget>,
    /// Mount call that has not settled yet
    pending: Option<PendingMount>,
    /// Next mount, started once `pending` settles
    queued: Option<MountRequest>,
}

impl WidgetBinder {
    pub fn new(provider: Arc<dyn WidgetProvider>, style: WidgetStyle) -> Self {
        Self {
            provider,
            style,
            mounted: None,
            pending: None,
            queued: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// A provider mount call is still outstanding
    pub fn mount_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn handle(&self) -> Option<&WidgetHandle> {
        self.mounted.as_ref().map(|m| &m.handle)
    }

    /// Ask the provider for one widget for `generation`.
    ///
    /// The outcome arrives on `sink` as `WidgetMounted` and must be passed to
    /// [`settle_mount`](Self::settle_mount). Requires a Tokio runtime.
    pub fn request_mount(
        &mut self,
        slot: &WidgetSlot,
        generation: Generation,
        secret: &SecretString,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), ClassifiedError> {
        if let Some(existing) = &self.mounted {
            return Err(ClassifiedError::new(
                ErrorKind::Unknown,
                format!(
                    "widget for {} is still mounted; unmount before mounting {}",
                    existing.handle.generation, generation
                ),
            ));
        }

        let request = MountRequest {
            slot: slot.clone(),
            generation,
            secret: SecretString::from(secret.expose_secret().to_owned()),
            sink,
        };
        match &self.pending {
            Some(unsettled) => {
                tracing::debug!(
                    generation = %generation,
                    unsettled = %unsettled.generation,
                    "Mount queued behind an unsettled mount"
                );
                self.queued = Some(request);
            }
            None => self.spawn_mount(request),
        }
        Ok(())
    }

    fn spawn_mount(&mut self, request: MountRequest) {
        let MountRequest {
            slot,
            generation,
            secret,
            sink,
        } = request;
        self.pending = Some(PendingMount {
            generation,
            sink: sink.clone(),
        });

        let provider = self.provider.clone();
        let style = self.style.clone();
        tokio::spawn(async move {
            let result = provider
                .mount(
                    &slot,
                    MountOptions {
                        secret: &secret,
                        style: &style,
                    },
                )
                .await;
            let settled = SessionEvent {
                generation,
                kind: SessionEventKind::WidgetMounted(result),
            };
            // Nobody is left to settle this mount
            if let Err(returned) = sink.send(settled) {
                if let SessionEventKind::WidgetMounted(Ok(widget)) = returned.0.kind {
                    provider.destroy(&widget);
                }
            }
        });
    }

    /// Fold a settled mount call into the binder.
    ///
    /// With `accept` the widget becomes the live instance; otherwise it is
    /// destroyed. Either way a queued mount is started afterwards if no
    /// widget is live.
    pub(crate) fn settle_mount(
        &mut self,
        generation: Generation,
        result: Result<WidgetRef, ClassifiedError>,
        accept: bool,
    ) -> MountSettlement {
        let pending = match self.pending.take() {
            Some(pending) if pending.generation == generation => pending,
            other => {
                self.pending = other;
                if let Ok(widget) = &result {
                    self.provider.destroy(widget);
                }
                return MountSettlement::Released;
            }
        };

        let settlement = match result {
            Ok(widget) if accept && self.mounted.is_none() => {
                self.attach(generation, widget, pending.sink);
                MountSettlement::Attached
            }
            Ok(widget) => {
                self.provider.destroy(&widget);
                tracing::debug!(
                    generation = %generation,
                    widget_id = %widget.id,
                    "Released a widget that is no longer wanted"
                );
                MountSettlement::Released
            }
            Err(err) if accept => MountSettlement::Failed(err),
            Err(_) => MountSettlement::Released,
        };

        if self.mounted.is_none() {
            if let Some(next) = self.queued.take() {
                self.spawn_mount(next);
            }
        }
        settlement
    }

    fn attach(
        &mut self,
        generation: Generation,
        widget: WidgetRef,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let attached = Arc::new(AtomicBool::new(true));
        let listener_attached = attached.clone();
        self.provider.on(
            &widget,
            Arc::new(move |event: WidgetEvent| {
                if !listener_attached.load(Ordering::Acquire) {
                    return;
                }
                // The receiver is gone once the orchestrator is dropped
                let _ = sink.send(SessionEvent {
                    generation,
                    kind: SessionEventKind::Widget(event),
                });
            }),
        );

        tracing::info!(
            generation = %generation,
            widget_id = %widget.id,
            "Mounted secure widget"
        );

        self.mounted = Some(MountedWidget {
            widget,
            handle: WidgetHandle::new(generation),
            attached,
        });
    }

    /// Detach listeners and destroy the provider instance.
    ///
    /// A queued mount is dropped; an unsettled one is released when it
    /// settles. Returns the generation of the widget that was released.
    pub fn unmount(&mut self) -> Option<Generation> {
        self.queued = None;
        let mounted = self.mounted.take()?;
        mounted.attached.store(false, Ordering::Release);
        self.provider.destroy(&mounted.widget);
        tracing::info!(
            generation = %mounted.handle.generation,
            widget_id = %mounted.widget.id,
            "Unmounted secure widget"
        );
        Some(mounted.handle.generation)
    }

    /// Fold a provider event into the handle of the current widget.
    pub(crate) fn apply(
        &mut self,
        generation: Generation,
        event: WidgetEvent,
    ) -> Result<WidgetSignal, LifecycleError> {
        let mounted = self
            .mounted
            .as_mut()
            .ok_or(LifecycleError::NotMounted(generation))?;

        if mounted.handle.generation != generation {
            return Err(LifecycleError::StaleGeneration {
                received: generation,
                current: mounted.handle.generation,
            });
        }

        match event {
            WidgetEvent::Ready => {
                mounted.handle.ready = true;
                Ok(WidgetSignal::Ready)
            }
            WidgetEvent::Change { complete, error } => {
                mounted.handle.valid = complete && error.is_none();
                mounted.handle.last_error = error.clone();
                Ok(WidgetSignal::Changed {
                    valid: mounted.handle.valid,
                    error,
                })
            }
            WidgetEvent::Destroy => {
                // Already gone on the provider side; do not destroy twice
                mounted.attached.store(false, Ordering::Release);
                tracing::warn!(
                    generation = %generation,
                    widget_id = %mounted.widget.id,
                    "Provider destroyed the secure widget"
                );
                self.mounted = None;
                Ok(WidgetSignal::Destroyed)
            }
        }
    }

    /// Build the tokenize-then-confirm exchange for the mounted widget.
    ///
    /// The returned future owns everything it needs, so it can outlive a
    /// later unmount; its result is then dropped by the generation check.
    pub(crate) fn exchange(
        &self,
        secret: SecretString,
    ) -> Option<BoxFuture<'static, Result<ConfirmOutcome, ClassifiedError>>> {
        let mounted = self.mounted.as_ref()?;
        let provider = self.provider.clone();
        let widget = mounted.widget.clone();
        Some(
            async move {
                let token = provider.tokenize(&widget).await?;
                provider.confirm(&secret, &token).await
            }
            .boxed(),
        )
    }
}

impl Drop for WidgetBinder {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Request a mount and settle it as soon as the provider answers.
#[cfg(test)]
pub(crate) async fn mount_now(
    binder: &mut WidgetBinder,
    slot: &WidgetSlot,
    generation: Generation,
    secret: &SecretString,
    sink: mpsc::UnboundedSender<SessionEvent>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> MountSettlement {
    binder
        .request_mount(slot, generation, secret, sink)
        .expect("mount request rejected");
    loop {
        let event = events.recv().await.expect("session channel closed");
        if let SessionEventKind::WidgetMounted(result) = event.kind {
            return binder.settle_mount(event.generation, result, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{ProviderCall, ProviderScript, SimulatedWidgetProvider};

    fn secret() -> SecretString {
        SecretString::from("sec_1".to_string())
    }

    fn binder(provider: &Arc<SimulatedWidgetProvider>) -> WidgetBinder {
        WidgetBinder::new(provider.clone(), WidgetStyle::default())
    }

    fn manual_provider() -> Arc<SimulatedWidgetProvider> {
        Arc::new(SimulatedWidgetProvider::new(ProviderScript::manual()))
    }

    async fn next_mount(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (Generation, Result<WidgetRef, ClassifiedError>) {
        loop {
            let event = events.recv().await.unwrap();
            if let SessionEventKind::WidgetMounted(result) = event.kind {
                return (event.generation, result);
            }
        }
    }

    #[tokio::test]
    async fn mount_routes_events_tagged_with_generation() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let settled = mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(4),
            &secret(),
            tx,
            &mut rx,
        )
        .await;
        assert_eq!(settled, MountSettlement::Attached);
        assert!(!binder.mount_pending());
        assert!(provider.emit_latest(WidgetEvent::Ready));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, Generation(4));
        assert!(matches!(
            event.kind,
            SessionEventKind::Widget(WidgetEvent::Ready)
        ));
    }

    #[tokio::test]
    async fn refuses_second_mount_while_one_is_live() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = WidgetSlot::new("card");

        mount_now(&mut binder, &slot, Generation(1), &secret(), tx.clone(), &mut rx).await;
        let err = binder
            .request_mount(&slot, Generation(2), &secret(), tx)
            .unwrap_err();

        assert!(err.message.contains("still mounted"));
        assert_eq!(provider.live_widgets(), 1);
        assert_eq!(binder.handle().unwrap().generation, Generation(1));
    }

    #[tokio::test]
    async fn unmount_destroys_before_next_mount() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = WidgetSlot::new("card");

        mount_now(&mut binder, &slot, Generation(1), &secret(), tx.clone(), &mut rx).await;
        assert_eq!(binder.unmount(), Some(Generation(1)));
        assert_eq!(binder.unmount(), None);
        mount_now(&mut binder, &slot, Generation(2), &secret(), tx, &mut rx).await;

        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::Mount("w1".to_string()),
                ProviderCall::Destroy("w1".to_string()),
                ProviderCall::Mount("w2".to_string()),
            ]
        );
        assert_eq!(provider.max_live_widgets(), 1);
    }

    #[tokio::test]
    async fn stale_mount_is_released_before_queued_mount_starts() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = WidgetSlot::new("card");

        binder
            .request_mount(&slot, Generation(1), &secret(), tx.clone())
            .unwrap();
        binder
            .request_mount(&slot, Generation(3), &secret(), tx)
            .unwrap();

        let (generation, result) = next_mount(&mut rx).await;
        assert_eq!(generation, Generation(1));
        assert_eq!(
            binder.settle_mount(generation, result, false),
            MountSettlement::Released
        );

        let (generation, result) = next_mount(&mut rx).await;
        assert_eq!(generation, Generation(3));
        assert_eq!(
            binder.settle_mount(generation, result, true),
            MountSettlement::Attached
        );

        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::Mount("w1".to_string()),
                ProviderCall::Destroy("w1".to_string()),
                ProviderCall::Mount("w2".to_string()),
            ]
        );
        assert_eq!(provider.max_live_widgets(), 1);
        assert_eq!(binder.handle().unwrap().generation, Generation(3));
    }

    #[tokio::test]
    async fn unmount_drops_queued_mount() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = WidgetSlot::new("card");

        binder
            .request_mount(&slot, Generation(1), &secret(), tx.clone())
            .unwrap();
        binder
            .request_mount(&slot, Generation(2), &secret(), tx)
            .unwrap();
        assert_eq!(binder.unmount(), None);

        let (generation, result) = next_mount(&mut rx).await;
        binder.settle_mount(generation, result, false);

        assert!(!binder.mount_pending());
        assert_eq!(provider.mount_calls(), 1);
        assert_eq!(provider.live_widgets(), 0);
    }

    #[tokio::test]
    async fn unsettled_mount_is_destroyed_when_nobody_listens() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, rx) = mpsc::unbounded_channel();

        binder
            .request_mount(&WidgetSlot::new("card"), Generation(1), &secret(), tx)
            .unwrap();
        drop(rx);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(provider.mount_calls(), 1);
        assert_eq!(provider.live_widgets(), 0);
    }

    #[tokio::test]
    async fn mount_failure_is_reported_when_accepted() {
        let provider = Arc::new(SimulatedWidgetProvider::new(ProviderScript {
            fail_mount: Some(ClassifiedError::new(ErrorKind::Processing, "sdk offline")),
            ..ProviderScript::manual()
        }));
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let settled = mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(1),
            &secret(),
            tx,
            &mut rx,
        )
        .await;
        assert!(matches!(settled, MountSettlement::Failed(_)));
        assert!(!binder.is_mounted());
    }

    #[tokio::test]
    async fn readiness_and_validity_are_independent() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(1),
            &secret(),
            tx,
            &mut rx,
        )
        .await;

        binder.apply(Generation(1), WidgetEvent::Ready).unwrap();
        let signal = binder
            .apply(
                Generation(1),
                WidgetEvent::Change {
                    complete: false,
                    error: Some(ClassifiedError::incomplete("card number is incomplete")),
                },
            )
            .unwrap();

        let handle = binder.handle().unwrap();
        assert!(handle.ready);
        assert!(!handle.valid);
        assert!(matches!(signal, WidgetSignal::Changed { valid: false, .. }));

        binder
            .apply(
                Generation(1),
                WidgetEvent::Change {
                    complete: true,
                    error: None,
                },
            )
            .unwrap();
        let handle = binder.handle().unwrap();
        assert!(handle.accepts_submit());
        assert!(handle.last_error.is_none());
    }

    #[tokio::test]
    async fn events_for_other_generations_are_rejected() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(
            binder.apply(Generation(1), WidgetEvent::Ready),
            Err(LifecycleError::NotMounted(Generation(1)))
        );

        mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(2),
            &secret(),
            tx,
            &mut rx,
        )
        .await;
        assert_eq!(
            binder.apply(Generation(1), WidgetEvent::Ready),
            Err(LifecycleError::StaleGeneration {
                received: Generation(1),
                current: Generation(2)
            })
        );
        assert!(!binder.handle().unwrap().ready);
    }

    #[tokio::test]
    async fn provider_destroy_releases_without_second_destroy() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        let (tx, mut rx) = mpsc::unbounded_channel();
        mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(1),
            &secret(),
            tx,
            &mut rx,
        )
        .await;

        let signal = binder.apply(Generation(1), WidgetEvent::Destroy).unwrap();
        assert_eq!(signal, WidgetSignal::Destroyed);
        assert!(!binder.is_mounted());
        assert_eq!(binder.unmount(), None);
        assert!(!provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::Destroy(_))));
    }

    #[tokio::test]
    async fn dropping_binder_releases_widget() {
        let provider = manual_provider();
        {
            let mut binder = binder(&provider);
            let (tx, mut rx) = mpsc::unbounded_channel();
            mount_now(
                &mut binder,
                &WidgetSlot::new("card"),
                Generation(1),
                &secret(),
                tx,
                &mut rx,
            )
            .await;
            assert_eq!(provider.live_widgets(), 1);
        }
        assert_eq!(provider.live_widgets(), 0);
    }

    #[tokio::test]
    async fn exchange_requires_mounted_widget() {
        let provider = manual_provider();
        let mut binder = binder(&provider);
        assert!(binder.exchange(secret()).is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        mount_now(
            &mut binder,
            &WidgetSlot::new("card"),
            Generation(1),
            &secret(),
            tx,
            &mut rx,
        )
        .await;
        let outcome = binder.exchange(secret()).unwrap().await.unwrap();
        assert_eq!(outcome.confirmation_id.as_deref(), Some("conf_1"));
        assert_eq!(provider.tokenize_calls(), 1);
        assert_eq!(provider.confirm_calls(), 1);
    }
}
