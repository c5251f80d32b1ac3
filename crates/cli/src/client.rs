//! HTTP client for the greenops server.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use greenops_core::{JobStatus, ResultRecord};

use crate::reconciler::{FetchError, JobSnapshot, JobStatusSource};

/// Reply to `POST /analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: u32,
    #[serde(default)]
    pub enqueue_failures: u32,
}

#[derive(Deserialize)]
struct ResultsBody {
    results: Vec<ResultRecord>,
}

/// Client for the greenops server REST API.
pub struct ServerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { base_url, http })
    }

    /// Submit a request body (the `/analyze` JSON) as a new job.
    pub async fn submit(&self, body: &Value) -> Result<SubmitReceipt> {
        let url = format!("{}/analyze", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .context("failed to submit job")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("server returned {}: {}", status, body);
        }

        resp.json().await.context("failed to parse submit receipt")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        job_id: &str,
    ) -> Result<T, FetchError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(job_id.to_string()));
        }
        // 202 carries a status body just like 200.
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }

        resp.json().await.map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobStatusSource for ServerClient {
    async fn job_status(
        &self,
        job_id: &str,
        force_complete: bool,
    ) -> Result<JobSnapshot, FetchError> {
        let mut url = format!("{}/jobs/{}", self.base_url, job_id);
        if force_complete {
            url.push_str("?force_complete=true");
        }
        self.get_json(&url, job_id).await
    }

    async fn job_results(&self, job_id: &str) -> Result<Vec<ResultRecord>, FetchError> {
        let url = format!("{}/jobs/{}/results", self.base_url, job_id);
        let body: ResultsBody = self.get_json(&url, job_id).await?;
        Ok(body.results)
    }
}
