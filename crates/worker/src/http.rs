//! Analyzer that POSTs each work item to an HTTP analysis endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use greenops_core::{ResultRecord, WorkItem};

use crate::analyzer::{Analyzer, AnalyzerError};

/// Analyzer reached over HTTP: `POST {url}` with `{job_id, item_index,
/// item_type, payload}`, answered by a `ResultRecord` JSON body.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    url: String,
    fallback: bool,
}

impl HttpAnalyzer {
    pub fn new(url: &str, timeout: Duration, fallback: bool) -> Result<Self, AnalyzerError> {
        let invalid = |reason: String| AnalyzerError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            fallback,
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, item: &WorkItem) -> Result<ResultRecord, AnalyzerError> {
        let body = json!({
            "job_id": item.job_id,
            "item_index": item.item_index,
            "item_type": item.item_type,
            "payload": item.payload,
        });

        debug!(
            url = %self.url,
            job_id = %item.job_id,
            item_index = item.item_index,
            "Analyzer request"
        );

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                AnalyzerError::Rejected { status: status.as_u16(), body }
            } else {
                AnalyzerError::Api { status: status.as_u16(), body }
            });
        }

        response
            .json::<ResultRecord>()
            .await
            .map_err(|e| AnalyzerError::Parse(e.to_string()))
    }

    fn fallback(&self, item: &WorkItem, error: &AnalyzerError) -> Option<ResultRecord> {
        if !self.fallback || matches!(error, AnalyzerError::Rejected { .. }) {
            return None;
        }
        Some(ResultRecord::fallback(item, error.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item() -> WorkItem {
        WorkItem::new("job-1", 4, "ec2", json!({"instanceId": "i-abc", "cpu": 3.5}))
    }

    #[test]
    fn test_malformed_url_is_rejected_up_front() {
        for url in ["analyzer.internal/analyze", "ftp://analyzer.internal", ""] {
            let err = HttpAnalyzer::new(url, Duration::from_secs(5), true).err();
            assert!(matches!(err, Some(AnalyzerError::InvalidUrl { .. })), "{url}");
        }
    }

    #[tokio::test]
    async fn test_success_parses_result_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(body_partial_json(json!({"item_type": "ec2", "item_index": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "analysis": "Downsize to t3.micro",
                "metrics": {"monthly_cost_usd": 7.5}
            })))
            .mount(&server)
            .await;

        let url = format!("{}/analyze", server.uri());
        let analyzer = HttpAnalyzer::new(&url, Duration::from_secs(5), true).unwrap();
        let record = analyzer.analyze(&item()).await.unwrap();
        assert_eq!(record.analysis, "Downsize to t3.micro");
        assert_eq!(record.metrics.get("monthly_cost_usd"), Some(&7.5));
    }

    #[tokio::test]
    async fn test_client_error_is_rejected_without_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
            .mount(&server)
            .await;

        let analyzer = HttpAnalyzer::new(&server.uri(), Duration::from_secs(5), true).unwrap();
        let err = analyzer.analyze(&item()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Rejected { status: 422, .. }));
        assert!(analyzer.fallback(&item(), &err).is_none());
    }

    #[tokio::test]
    async fn test_server_error_gets_degraded_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let analyzer = HttpAnalyzer::new(&server.uri(), Duration::from_secs(5), true).unwrap();
        let err = analyzer.analyze(&item()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Api { status: 503, .. }));

        let record = analyzer.fallback(&item(), &err).unwrap();
        assert!(record.is_degraded());
        assert_eq!(record.resource_id.as_deref(), Some("i-abc"));
        assert!(record.analysis.starts_with("ERROR: Failed to analyze ec2"));
    }

    #[test]
    fn test_fallback_can_be_disabled() {
        let analyzer =
            HttpAnalyzer::new("http://localhost:1", Duration::from_secs(1), false).unwrap();
        let err = AnalyzerError::Timeout(Duration::from_secs(1));
        assert!(analyzer.fallback(&item(), &err).is_none());
    }
}
