//! AWS SQS work queue.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_sqs::error::SdkError;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use greenops_core::config::{AwsConfig, QueueConfig};
use greenops_core::WorkItem;

use crate::codec::encode_work_item;
use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::producer::QueueProducer;

/// SQS-backed queue, used both to enqueue work items and to consume them.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
}

/// Map an SDK failure onto the queue taxonomy: transport-level trouble
/// means the queue is unreachable, anything else is a per-call failure.
fn classify<E: std::fmt::Debug, R: std::fmt::Debug>(
    err: SdkError<E, R>,
    what: &str,
    otherwise: fn(String) -> QueueError,
) -> QueueError {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            QueueError::Connection(format!("SQS {what} failed: {err:?}"))
        }
        other => otherwise(format!("SQS {what} failed: {other:?}")),
    }
}

impl SqsQueue {
    /// Create a new SQS queue client from project config.
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        if queue.queue_url.is_empty() {
            return Err(QueueError::NotFound("QUEUE_URL not set".into()));
        }

        // The shared loader resolves the default credential chain (env, profile,
        // instance role); explicit keys and endpoint from our config win.
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(aws.region.clone()));

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "greenops-queue-static",
            );
            loader = loader.credentials_provider(creds);
        }

        if let Some(url) = aws.endpoint() {
            loader = loader.endpoint_url(url);
        }

        let shared = loader.load().await;
        let client = Client::new(&shared);

        info!(
            queue_url = %queue.queue_url,
            region = %aws.region,
            "SQS queue initialized"
        );

        Ok(Self {
            client,
            queue_url: queue.queue_url.clone(),
            dlq_url: queue.dlq_url.clone(),
            visibility_timeout_secs: i32::try_from(queue.visibility_timeout_secs)
                .unwrap_or(i32::MAX),
        })
    }

    async fn approximate_depth(&self, url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS attribute query failed: {e:?}")))?;

        Ok(resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok()))
    }
}

#[async_trait]
impl QueueProducer for SqsQueue {
    async fn enqueue(&self, item: &WorkItem) -> Result<String, QueueError> {
        let body = encode_work_item(item)?;

        let resp = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| classify(e, "send", QueueError::Send))?;

        let id = resp.message_id().unwrap_or("unknown").to_string();
        debug!(
            job_id = %item.job_id,
            item_index = item.item_index,
            message_id = %id,
            "Enqueued work item"
        );
        Ok(id)
    }

    fn provider(&self) -> &'static str {
        "sqs"
    }
}

#[async_trait]
impl QueueConsumer for SqsQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.clamp(1, 10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(20)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify(e, "receive", QueueError::Provider))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or("").to_string();
            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            // SentTimestamp is epoch millis.
            let timestamp = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id,
                body,
                receipt_handle,
                timestamp,
                attempt_count,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Nacking SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let count = self.approximate_depth(&self.queue_url).await?;
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }

    async fn dlq_depth(&self) -> Result<Option<u64>, QueueError> {
        match &self.dlq_url {
            Some(url) => self.approximate_depth(url).await,
            None => Ok(None),
        }
    }
}
