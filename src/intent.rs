//! Intent Requester
//!
//! Obtains the opaque transaction secret for one amount/recipient pair from
//! the backend. Exactly one request is in flight per generation; superseded
//! requests are not aborted, their results are dropped by the orchestrator.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

use crate::config::IntentEndpointConfig;
use crate::session::PaymentRequest;

/// Body sent to the intent endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    pub amount: u64,
    pub currency: String,
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl IntentRequest {
    pub fn from_payment(request: &PaymentRequest) -> Self {
        Self {
            amount: request.amount,
            currency: request.currency.clone(),
            recipient_id: request.recipient_id.clone(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A resolved intent. The secret only leaves this struct through the binder.
#[derive(Debug)]
pub struct Intent {
    pub secret: SecretString,
    pub attempt_id: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    /// Transport failure, including timeouts
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx status or explicit rejection in the body
    #[error("server rejected intent: {message}")]
    Server { status: Option<u16>, message: String },
}

#[async_trait]
pub trait IntentRequester: Send + Sync {
    async fn create(&self, request: &IntentRequest) -> Result<Intent, IntentError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntentResponseBody {
    Rejected {
        error: String,
    },
    Accepted {
        secret: String,
        #[serde(rename = "attemptId")]
        attempt_id: String,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Intent requester backed by an HTTP endpoint.
pub struct HttpIntentRequester {
    client: reqwest::Client,
    url: Url,
    api_key: Option<SecretString>,
}

impl HttpIntentRequester {
    pub fn new(url: Url) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pledge-checkout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key: None,
        })
    }

    /// Build from endpoint config; fails if no URL is configured.
    pub fn from_config(config: &IntentEndpointConfig) -> crate::Result<Self> {
        let url = config.url.clone().ok_or_else(|| {
            crate::Error::Config(format!(
                "Intent endpoint not configured. Set {} or `intent.url` in the config file.",
                crate::config::INTENT_URL_ENV
            ))
        })?;
        let mut requester = Self::new(url)?;
        if let Some(key) = config.api_key() {
            requester = requester.with_api_key(SecretString::from(key.expose_secret().to_owned()));
        }
        Ok(requester)
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

#[async_trait]
impl IntentRequester for HttpIntentRequester {
    async fn create(&self, request: &IntentRequest) -> Result<Intent, IntentError> {
        let mut builder = self.client.post(self.url.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| IntentError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IntentError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| {
                    status
                        .canonical_reason()
                        .unwrap_or("unexpected status")
                        .to_string()
                });
            tracing::warn!(status = status.as_u16(), message = %message, "Intent endpoint rejected request");
            return Err(IntentError::Server {
                status: Some(status.as_u16()),
                message,
            });
        }

        match serde_json::from_str::<IntentResponseBody>(&body) {
            Ok(IntentResponseBody::Accepted { secret, attempt_id }) => {
                tracing::debug!(attempt_id = %attempt_id, "Intent created");
                Ok(Intent {
                    secret: SecretString::from(secret),
                    attempt_id,
                })
            }
            Ok(IntentResponseBody::Rejected { error }) => Err(IntentError::Server {
                status: Some(status.as_u16()),
                message: error,
            }),
            Err(e) => Err(IntentError::Server {
                status: Some(status.as_u16()),
                message: format!("malformed intent response: {}", e),
            }),
        }
    }
}
