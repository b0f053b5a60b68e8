//! Relay to an external code-analysis service.
//!
//! The session only forwards a snapshot of its content and relays the JSON
//! result untouched. What the analysis does is the service's business.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub code: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<u32>>,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service not configured")]
    NotConfigured,
    #[error("analysis request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("analysis service returned {0}")]
    Status(u16),
}

/// Anything that can analyze a document. Implementations must be cheap to
/// share across sessions.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<serde_json::Value, AnalysisError>;
}

/// Posts the request as JSON and returns the response body as JSON.
#[derive(Debug, Clone)]
pub struct HttpAnalysisService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalysisService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(&self, request: AnalysisRequest) -> Result<serde_json::Value, AnalysisError> {
        log::debug!(
            "Posting {} chars of {} to {}",
            request.code.chars().count(),
            request.filename,
            self.endpoint
        );
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}
