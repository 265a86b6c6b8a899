//! Intent endpoint configuration
//!
//! Resolution order:
//! 1. `PLEDGE_INTENT_URL` / `PLEDGE_API_KEY` environment variables (highest priority)
//! 2. `intent.url` from the JSON config file
//! 3. Unset - commands that need the backend fail with a configuration error
//!
//! # Examples
//!
//! ```bash
//! export PLEDGE_INTENT_URL="https://api.example.com/v1/payment-intents"
//! export PLEDGE_API_KEY="sk_test_..."
//! ```
//!
//! The API key is never read from the config file and never serialized.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variable holding the intent endpoint URL
pub const INTENT_URL_ENV: &str = "PLEDGE_INTENT_URL";

/// Environment variable holding the backend API key
pub const API_KEY_ENV: &str = "PLEDGE_API_KEY";

/// Where and how to request transaction intents
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IntentEndpointConfig {
    /// Intent endpoint (POST)
    #[serde(default)]
    pub url: Option<Url>,
    /// Bearer token for the endpoint
    #[serde(skip)]
    api_key: Option<SecretString>,
}

impl IntentEndpointConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url: Some(url),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn api_key(&self) -> Option<&SecretString> {
        self.api_key.as_ref()
    }

    /// Build from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay environment variables on top of file settings
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(raw) = std::env::var(INTENT_URL_ENV) {
            let url = Url::parse(&raw).map_err(|e| {
                crate::Error::Config(format!("{} is not a valid URL: {}", INTENT_URL_ENV, e))
            })?;
            tracing::debug!(url = %url, "Using {} for intent endpoint", INTENT_URL_ENV);
            self.url = Some(url);
        }

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                tracing::debug!("Using {} for intent endpoint auth", API_KEY_ENV);
                self.api_key = Some(SecretString::from(key));
            }
        }

        if self.url.is_none() {
            tracing::debug!(
                "No intent endpoint configured; set {} to talk to a backend",
                INTENT_URL_ENV
            );
        }

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}
