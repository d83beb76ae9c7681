//! Conduit HTTP Client
//!
//! A typed client for the Conduit orchestrator API, shared by the CLI and
//! anything else that needs to trigger or inspect pipeline runs.
//!
//! # Example
//!
//! ```no_run
//! use conduit_client::OrchestratorClient;
//! use conduit_core::dto::run::TriggerRun;
//!
//! # async fn example() -> conduit_client::Result<()> {
//! let client = OrchestratorClient::new("http://localhost:8080");
//! let accepted = client.trigger_run(TriggerRun::default()).await?;
//! let status = client.get_run(accepted.run_id).await?;
//! println!("{} is {} ({})", status.run_id, status.state, status.console_url);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod artifacts;
mod runs;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the orchestrator API
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client around a configured reqwest `Client`
    ///
    /// Use this to set timeouts, proxies or TLS options.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the orchestrator is up
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        self.handle_empty_response(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize a JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a response whose body is not needed
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }

    /// Check the status code and return the raw body
    async fn handle_bytes(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let response = self.check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Orchestrator returned {}: {}", status, error_text);
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OrchestratorClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/runs"), "http://localhost:8080/runs");
    }

    #[test]
    fn test_client_with_custom_client() {
        let client = OrchestratorClient::with_client("http://ci:9000", Client::new());
        assert_eq!(client.base_url(), "http://ci:9000");
    }
}
