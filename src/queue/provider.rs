use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// What the execution engine reports for a dispatched phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    /// No record yet; it may not have propagated.
    NotFound,
    Running,
    Succeeded,
    Failed { detail: Option<String> },
}

/// Source of truth for phases that have left the queue.
/// Real implementation: `HttpStatusProvider`. Test doubles live next to the
/// coordinator tests.
#[async_trait]
pub trait ExternalStatusProvider: Send + Sync {
    async fn get_status(&self, external_ref: i64) -> Result<ExternalStatus>;

    /// Longer-form failure explanation, fetched only after a failure is seen.
    async fn failure_detail(&self, _external_ref: i64) -> Result<Option<String>> {
        Ok(None)
    }
}

/// One run record from the workflow-history service.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRecord {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FailureRecord {
    #[serde(default, alias = "message")]
    detail: Option<String>,
}

/// Map a workflow-history status string onto [`ExternalStatus`].
/// Unknown values are treated as still running so the phase is polled again.
pub fn parse_run_status(record: &RunRecord) -> ExternalStatus {
    match record.status.to_ascii_lowercase().as_str() {
        "completed" | "succeeded" | "success" => ExternalStatus::Succeeded,
        "failed" | "terminated" | "timed_out" | "cancelled" | "canceled" => {
            ExternalStatus::Failed {
                detail: record.error.clone().filter(|e| !e.trim().is_empty()),
            }
        }
        _ => ExternalStatus::Running,
    }
}

/// Queries a workflow-history HTTP service keyed by external reference:
/// `GET {base_url}/runs/{ref}` and `GET {base_url}/runs/{ref}/failure`.
pub struct HttpStatusProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn run_url(&self, external_ref: i64) -> String {
        format!("{}/runs/{}", self.base_url, external_ref)
    }
}

#[async_trait]
impl ExternalStatusProvider for HttpStatusProvider {
    async fn get_status(&self, external_ref: i64) -> Result<ExternalStatus> {
        let resp = self
            .client
            .get(self.run_url(external_ref))
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send run status request")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ExternalStatus::NotFound);
        }

        let record = resp
            .error_for_status()
            .context("Run status endpoint returned error status")?
            .json::<RunRecord>()
            .await
            .context("Failed to parse run status response")?;
        Ok(parse_run_status(&record))
    }

    async fn failure_detail(&self, external_ref: i64) -> Result<Option<String>> {
        let resp = self
            .client
            .get(format!("{}/failure", self.run_url(external_ref)))
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send failure detail request")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let record = resp
            .error_for_status()
            .context("Failure detail endpoint returned error status")?
            .json::<FailureRecord>()
            .await
            .context("Failed to parse failure detail response")?;
        Ok(record.detail.filter(|d| !d.trim().is_empty()))
    }
}
