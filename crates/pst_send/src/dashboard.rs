//! Client for the SDP Data Product Dashboard REST API.

use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};
use crate::retry::Backoff;

/// Registration endpoint, relative to the configured dashboard URL.
pub const ADD_DATA_PRODUCT_PATH: &str = "/dataproduct/api/addDataProduct";

/// Per-attempt request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Total attempts per registration (first try plus retries).
const MAX_ATTEMPTS: u32 = 3;

/// HTTP client for registering completed data products.
#[derive(Debug, Clone)]
pub struct DpdClient {
    endpoint: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl DpdClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransferError::DashboardUnavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            max_attempts: MAX_ATTEMPTS,
        })
    }

    #[cfg(test)]
    fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the metadata document. Any 2xx is success; non-2xx and transport
    /// errors are retried with backoff before surfacing
    /// `DashboardUnavailable`.
    pub async fn register(
        &self,
        metadata: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = format!("{}{}", self.endpoint, ADD_DATA_PRODUCT_PATH);
        let mut backoff = Backoff::new(self.max_attempts);
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let outcome = match self.client.post(&url).json(metadata).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url, status = %response.status(), "data product registered");
                    return Ok(());
                }
                Ok(response) => TransferError::DashboardUnavailable {
                    reason: format!("{} returned {}", url, response.status()),
                },
                Err(e) => TransferError::DashboardUnavailable {
                    reason: format!("{url}: {e}"),
                },
            };
            match backoff.next_delay() {
                Some(delay) => {
                    warn!(error = %outcome, retry_in = ?delay, "dashboard registration failed, retrying");
                    if cancel.sleep(delay).await {
                        return Err(TransferError::Cancelled);
                    }
                }
                None => return Err(outcome),
            }
        }
    }
}
