//! Work items carried by the queue and the result records workers produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known keys that identify a resource inside an opaque payload
/// (tried in order).
const RESOURCE_ID_KEYS: &[&str] = &[
    "instanceId",
    "bucketName",
    "dbInstanceIdentifier",
    "id",
    "arn",
    "name",
];

/// One unit of work derived from a job.
///
/// `payload` is opaque to the orchestration layer and must round-trip
/// through the queue unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: String,
    pub item_index: u32,
    pub item_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(
        job_id: impl Into<String>,
        item_index: u32,
        item_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            item_index,
            item_type: item_type.into(),
            payload,
        }
    }

    /// Best-effort identifier of the resource this item describes.
    pub fn resource_id(&self) -> Option<String> {
        resource_id_of(&self.payload)
    }
}

/// First of [`RESOURCE_ID_KEYS`] present on a JSON object payload.
pub fn resource_id_of(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    RESOURCE_ID_KEYS.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Analyzer output for one work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub item_index: u32,
    #[serde(default)]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Identifying fields of the analyzed resource.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub resource: Value,
    #[serde(default)]
    pub analysis: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f64>,
    /// Set on degraded records produced after an analyzer error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultRecord {
    /// Degraded record for an item whose analysis failed.
    pub fn fallback(item: &WorkItem, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            item_index: item.item_index,
            item_type: item.item_type.clone(),
            resource_id: item.resource_id(),
            resource: item.payload.clone(),
            analysis: format!("ERROR: Failed to analyze {}: {}", item.item_type, error),
            metrics: BTreeMap::new(),
            embedding: Vec::new(),
            error: Some(error),
        }
    }

    /// Stamp the identifying fields of `item` onto the record, keeping any
    /// the analyzer already filled in.
    pub fn for_item(mut self, item: &WorkItem) -> Self {
        self.item_index = item.item_index;
        if self.item_type.is_empty() {
            self.item_type = item.item_type.clone();
        }
        if self.resource_id.is_none() {
            self.resource_id = item.resource_id();
        }
        self
    }

    /// No resource, no analysis and no metrics: nothing worth appending.
    pub fn is_empty(&self) -> bool {
        self.resource.is_null()
            && self.resource_id.is_none()
            && self.analysis.is_empty()
            && self.metrics.is_empty()
            && self.embedding.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Name of the first numeric field that cannot be persisted (NaN/inf).
    pub fn first_non_finite(&self) -> Option<String> {
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Some(format!("metrics.{name}"));
        }
        self.embedding
            .iter()
            .position(|v| !v.is_finite())
            .map(|i| format!("embedding[{i}]"))
    }
}
