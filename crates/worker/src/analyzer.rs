//! Analyzer contract and the type-tag registry that selects one per item.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use greenops_core::config::WorkerConfig;
use greenops_core::{ResultRecord, WorkItem};

use crate::http::HttpAnalyzer;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    /// The analyzer refused the payload itself (HTTP 4xx). Retrying or
    /// degrading will not help.
    #[error("analyzer rejected payload ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("analyzer error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("analyzer unreachable: {0}")]
    Transport(String),

    #[error("failed to parse analyzer response: {0}")]
    Parse(String),

    #[error("no analyzer registered for item type {0:?}")]
    UnknownType(String),

    #[error("invalid analyzer URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// An external analysis pipeline for one or more item types.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, item: &WorkItem) -> Result<ResultRecord, AnalyzerError>;

    /// Degraded record to store when `analyze` failed, if this analyzer
    /// offers one. `None` means the item is counted as failed.
    fn fallback(&self, _item: &WorkItem, _error: &AnalyzerError) -> Option<ResultRecord> {
        None
    }

    fn name(&self) -> &str;
}

/// Maps `item_type` tags to analyzers, with an optional catch-all.
#[derive(Default, Clone)]
pub struct AnalyzerRegistry {
    by_type: HashMap<String, Arc<dyn Analyzer>>,
    default: Option<Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `analyzer` for one type tag (case-insensitive).
    pub fn register(mut self, item_type: &str, analyzer: Arc<dyn Analyzer>) -> Self {
        self.by_type.insert(item_type.to_lowercase(), analyzer);
        self
    }

    /// Analyzer used for any type without an explicit registration.
    pub fn with_default(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.default = Some(analyzer);
        self
    }

    pub fn get(&self, item_type: &str) -> Result<Arc<dyn Analyzer>, AnalyzerError> {
        self.by_type
            .get(&item_type.to_lowercase())
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| AnalyzerError::UnknownType(item_type.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.default.is_none()
    }

    /// HTTP analyzers for `ANALYZER_URL` and every `ANALYZER_URL_<TYPE>`.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, AnalyzerError> {
        let timeout = config.analyzer_timeout();
        let mut registry = Self::new();

        if let Some(url) = &config.analyzer_url {
            let analyzer = HttpAnalyzer::new(url, timeout, config.analyzer_fallback)?;
            registry = registry.with_default(Arc::new(analyzer));
            info!(url = %url, "Default analyzer registered");
        }
        for (item_type, url) in &config.analyzer_urls {
            let analyzer = HttpAnalyzer::new(url, timeout, config.analyzer_fallback)?;
            registry = registry.register(item_type, Arc::new(analyzer));
            info!(item_type = %item_type, url = %url, "Analyzer registered");
        }
        Ok(registry)
    }
}
