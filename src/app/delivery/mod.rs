pub mod circuit_breaker;
pub mod classifier;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::delivery::DeliveryConfig;

pub use circuit_breaker::CircuitBreaker;
pub use classifier::{classify, Outcome};
pub use retry::RetryPolicy;

/// Transport-level failures. Anything here is retriable; HTTP responses,
/// including error statuses, come back as `DeliveryResponse` and are
/// classified separately.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery request timed out")]
    Timeout,

    #[error("delivery transport error: {0}")]
    Transport(String),

    #[error("delivery circuit breaker is open")]
    BreakerOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub to: String,
    pub content: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryResponse {
    pub success: bool,
    pub status_code: u16,
    pub body: Option<String>,
}

/// Downstream delivery provider. The provider deduplicates on
/// `idempotency_key`, which is what closes the crash window between a
/// successful send and the log write: the repeated send is absorbed there.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, DeliveryError>;
}

/// HTTP client for the delivery provider.
pub struct HttpDeliveryClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDeliveryClient {
    pub fn new(config: &DeliveryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(HttpDeliveryClient {
            client,
            endpoint: format!("{}/send", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status_code = response.status().as_u16();
        let success = response.status().is_success();
        let body = response.text().await.ok().filter(|b| !b.is_empty());

        Ok(DeliveryResponse { success, status_code, body })
    }
}
