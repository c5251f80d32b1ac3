//! JSON codec between [`WorkItem`]s and queue message bodies.
//!
//! This is the only place work items are (de)serialized for transport, so
//! producers and consumers cannot drift apart on the format.

use greenops_core::WorkItem;

use crate::consumer::QueueMessage;
use crate::error::QueueError;

/// Serialize a work item into a message body.
pub fn encode_work_item(item: &WorkItem) -> Result<String, QueueError> {
    serde_json::to_string(item).map_err(|e| {
        QueueError::Encode(format!("work item {}#{}: {e}", item.job_id, item.item_index))
    })
}

/// Parse a received message body back into a work item.
pub fn decode_work_item(msg: &QueueMessage) -> Result<WorkItem, QueueError> {
    let item: WorkItem = serde_json::from_str(&msg.body)
        .map_err(|e| QueueError::Parse(format!("message {}: {e}", msg.id)))?;
    if item.job_id.is_empty() {
        return Err(QueueError::Parse(format!("message {}: empty job_id", msg.id)));
    }
    if item.item_type.is_empty() {
        return Err(QueueError::Parse(format!("message {}: empty item_type", msg.id)));
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(body: String) -> QueueMessage {
        QueueMessage {
            id: "m-1".into(),
            body,
            receipt_handle: "r-1".into(),
            timestamp: Utc::now(),
            attempt_count: 1,
        }
    }

    #[test]
    fn test_payload_round_trips_unchanged() {
        let item = WorkItem::new(
            "job-9",
            3,
            "s3",
            json!({
                "bucketName": "logs",
                "storageClasses": {"STANDARD": 1024},
                "lifecycleRules": []
            }),
        );
        let body = encode_work_item(&item).unwrap();
        let decoded = decode_work_item(&message(body)).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_garbage_body_is_a_parse_error() {
        let err = decode_work_item(&message("not json".into())).unwrap_err();
        assert!(matches!(err, QueueError::Parse(_)));
    }

    #[test]
    fn test_missing_job_id_is_rejected() {
        let body = json!({"job_id": "", "item_index": 0, "item_type": "ec2"}).to_string();
        assert!(decode_work_item(&message(body)).is_err());
    }
}
