//! Secure widget capability interface
//!
//! The secure input widget is hosted and controlled by the payment provider.
//! This module describes it as a narrow capability set so the binder can be
//! driven by a real SDK bridge or by the in-process simulator alike.
//!
//! SECURITY NOTE:
//! - Card data never crosses this interface; only opaque tokens do
//! - The intent secret is handed to the provider at mount and confirm time only

mod binder;

pub use binder::{WidgetBinder, WidgetSignal};
pub(crate) use binder::MountSettlement;
#[cfg(test)]
pub(crate) use binder::mount_now;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::WidgetStyle;
use crate::error::ClassifiedError;
use crate::session::Generation;

/// UI container the widget is mounted into (e.g. a DOM element id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WidgetSlot(pub String);

impl WidgetSlot {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Provider-issued reference to one mounted widget instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetRef {
    pub id: String,
}

/// Tokenized payment input, produced by the provider from the widget contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentToken(pub String);

/// Arguments for `WidgetProvider::mount`
pub struct MountOptions<'a> {
    pub secret: &'a SecretString,
    pub style: &'a WidgetStyle,
}

/// Events emitted by a mounted widget
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEvent {
    /// Rendered and interactive
    Ready,
    /// Input changed; `complete` is the provider's own completeness verdict
    Change {
        complete: bool,
        error: Option<ClassifiedError>,
    },
    /// The provider tore the instance down on its own
    Destroy,
}

pub type WidgetEventHandler = Arc<dyn Fn(WidgetEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Succeeded,
    Failed,
}

/// Provider response to `confirm`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub status: ConfirmStatus,
    #[serde(default, rename = "confirmationId")]
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub error: Option<ClassifiedError>,
}

impl ConfirmOutcome {
    pub fn succeeded(confirmation_id: impl Into<String>) -> Self {
        Self {
            status: ConfirmStatus::Succeeded,
            confirmation_id: Some(confirmation_id.into()),
            error: None,
        }
    }

    pub fn failed(error: ClassifiedError) -> Self {
        Self {
            status: ConfirmStatus::Failed,
            confirmation_id: None,
            error: Some(error),
        }
    }
}

/// Capability set of an external secure widget SDK.
///
/// Only [`WidgetBinder`] calls into a provider.
#[async_trait]
pub trait WidgetProvider: Send + Sync {
    /// Create a widget instance inside `slot`, bound to the intent secret
    async fn mount(
        &self,
        slot: &WidgetSlot,
        options: MountOptions<'_>,
    ) -> Result<WidgetRef, ClassifiedError>;

    /// Register the event handler for a mounted widget
    fn on(&self, widget: &WidgetRef, handler: WidgetEventHandler);

    /// Turn the widget's current input into a payment token
    async fn tokenize(&self, widget: &WidgetRef) -> Result<PaymentToken, ClassifiedError>;

    /// Confirm the transaction scoped by `secret` using `token`
    async fn confirm(
        &self,
        secret: &SecretString,
        token: &PaymentToken,
    ) -> Result<ConfirmOutcome, ClassifiedError>;

    /// Destroy the instance and drop every handler registered on it
    fn destroy(&self, widget: &WidgetRef);
}

/// Binder-side view of the mounted widget.
///
/// Readiness and validity are tracked independently: a widget can be ready
/// (rendered, interactive) while its input is still invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetHandle {
    pub generation: Generation,
    pub ready: bool,
    pub valid: bool,
    pub last_error: Option<ClassifiedError>,
}

impl WidgetHandle {
    pub(crate) fn new(generation: Generation) -> Self {
        Self {
            generation,
            ready: false,
            valid: false,
            last_error: None,
        }
    }

    pub fn accepts_submit(&self) -> bool {
        self.ready && self.valid
    }
}
