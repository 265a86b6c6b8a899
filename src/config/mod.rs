//! Configuration for the payment session controller

pub mod endpoint;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ValidationError;
use crate::session::PaymentRequest;

// Re-export endpoint config
pub use endpoint::{IntentEndpointConfig, API_KEY_ENV, INTENT_URL_ENV};

/// Accepted amount range, in minor currency units (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountLimits {
    pub min: u64,
    pub max: u64,
}

impl AmountLimits {
    pub fn contains(&self, amount: u64) -> bool {
        (self.min..=self.max).contains(&amount)
    }
}

impl Default for AmountLimits {
    fn default() -> Self {
        Self {
            min: 100,       // 1.00
            max: 1_000_000, // 10,000.00
        }
    }
}

/// Optional deadlines for the two network-bound stages.
///
/// Both default to `None`: a hung call leaves the session pending until the
/// caller cancels or starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TimeoutConfig {
    /// Intent creation deadline (milliseconds)
    #[serde(default)]
    pub intent_ms: Option<u64>,
    /// Tokenize + confirm deadline (milliseconds)
    #[serde(default)]
    pub confirm_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn intent(&self) -> Option<Duration> {
        self.intent_ms.map(Duration::from_millis)
    }

    pub fn confirm(&self) -> Option<Duration> {
        self.confirm_ms.map(Duration::from_millis)
    }
}

/// Opaque style settings handed to the widget provider at mount time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WidgetStyle {
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    /// Provider-specific overrides, passed through untouched
    #[serde(default)]
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

/// Settings the orchestrator itself consults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Accepted amount range
    #[serde(default)]
    pub limits: AmountLimits,
    /// Upper-case ISO 4217 codes accepted by `start()`
    #[serde(default = "default_currencies")]
    pub allowed_currencies: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub widget: WidgetStyle,
}

fn default_currencies() -> Vec<String> {
    vec!["EUR".to_string(), "USD".to_string(), "GBP".to_string()]
}

impl SessionConfig {
    /// Synchronous checks run by `start()` before any state change
    pub fn validate(&self, request: &PaymentRequest) -> Result<(), ValidationError> {
        if !self.limits.contains(request.amount) {
            return Err(ValidationError::AmountOutOfBounds {
                amount: request.amount,
                min: self.limits.min,
                max: self.limits.max,
            });
        }

        if request.recipient_id.trim().is_empty() {
            return Err(ValidationError::MissingRecipient);
        }

        if !self
            .allowed_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&request.currency))
        {
            return Err(ValidationError::UnsupportedCurrency(request.currency.clone()));
        }

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            limits: AmountLimits::default(),
            allowed_currencies: default_currencies(),
            timeouts: TimeoutConfig::default(),
            widget: WidgetStyle::default(),
        }
    }
}

/// Main configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Backend intent endpoint
    #[serde(default)]
    pub intent: IntentEndpointConfig,
    /// Path to the lifecycle audit log (JSONL)
    #[serde(default)]
    pub audit_log_path: Option<String>,
}

impl Config {
    /// Load from a JSON file, then overlay environment variables
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    crate::Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&content)
                    .map_err(|e| crate::Error::Config(e.to_string()))?
            }
            None => Config::default(),
        };
        config.intent.apply_env()?;
        Ok(config)
    }
}
