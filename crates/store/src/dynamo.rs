//! DynamoDB job store.
//!
//! One item per job, keyed by `job_id`. Progress writes are a single
//! conditional `UpdateItem`: the `processed_items` number set is the
//! idempotency record, and `ReturnValuesOnConditionCheckFailure = ALL_OLD`
//! lets a rejected write tell "unknown job" apart from "already recorded".

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, ReturnValue,
    ReturnValuesOnConditionCheckFailure, ScalarAttributeType, TableStatus, TimeToLiveSpecification,
};
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use tracing::{debug, info, warn};

use greenops_core::config::{AwsConfig, StoreConfig};
use greenops_core::job::final_status_for;
use greenops_core::{ItemOutcome, Job, JobStatus, ProgressUpdate};

use crate::attributes::{
    self, item_progress, item_to_job, job_to_item, num, record_to_attr, string, Item,
    COMPLETED_ITEMS, EXPIRATION_TIME, FAILED_ITEMS, JOB_ID,
};
use crate::error::StoreError;
use crate::store::JobStore;

/// Error codes DynamoDB documents as safe to retry.
const TRANSIENT_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflictException",
];

const TABLE_ACTIVE_POLLS: u32 = 30;

fn classify<E, R>(err: SdkError<E, R>, what: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let transient = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            ctx.err().code().is_some_and(|c| TRANSIENT_CODES.contains(&c))
        }
        _ => false,
    };
    let msg = format!("DynamoDB {what} failed: {err:?}");
    if transient {
        StoreError::Transient(msg)
    } else {
        StoreError::Backend(msg)
    }
}

/// `UpdateExpression` for one progress write.
fn progress_update_expression(with_result: bool) -> String {
    let mut expr =
        String::from("ADD #counter :one, processed_items :idx_set SET updated_at = :now");
    if with_result {
        expr.push_str(", results = list_append(if_not_exists(results, :empty), :result)");
    }
    expr
}

const PROGRESS_CONDITION: &str =
    "attribute_exists(job_id) AND NOT contains(processed_items, :idx) AND total_items > :idx";

/// `ConditionExpression` admitting only the legal predecessors of a status,
/// plus the placeholder values it references.
fn status_condition(predecessors: &[JobStatus]) -> (String, Vec<(String, AttributeValue)>) {
    let placeholders: Vec<String> = (0..predecessors.len()).map(|i| format!(":from{i}")).collect();
    let expr = format!("attribute_exists(job_id) AND #status IN ({})", placeholders.join(", "));
    let values = placeholders
        .into_iter()
        .zip(predecessors)
        .map(|(name, status)| (name, string(status.as_str())))
        .collect();
    (expr, values)
}

fn status_update_expression(terminal: bool) -> &'static str {
    if terminal {
        "SET #status = :status, updated_at = :now, completed_at = :now"
    } else {
        "SET #status = :status, updated_at = :now"
    }
}

pub struct DynamoJobStore {
    client: Client,
    table: String,
    ttl: chrono::Duration,
}

impl DynamoJobStore {
    pub async fn new(aws: &AwsConfig, store: &StoreConfig) -> Result<Self, StoreError> {
        if store.table_name.is_empty() {
            return Err(StoreError::Backend("JOBS_TABLE not set".into()));
        }

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(aws.region.clone()));

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "greenops-store-static",
            );
            loader = loader.credentials_provider(creds);
        }

        if let Some(url) = aws.endpoint() {
            loader = loader.endpoint_url(url);
        }

        let shared = loader.load().await;

        info!(table = %store.table_name, region = %aws.region, "DynamoDB job store initialized");

        Ok(Self {
            client: Client::new(&shared),
            table: store.table_name.clone(),
            ttl: store.ttl(),
        })
    }

    fn key(job_id: &str) -> (String, AttributeValue) {
        (JOB_ID.to_string(), string(job_id))
    }

    /// Create the jobs table if it does not exist and enable native TTL on
    /// `expiration_time`. Meant for local endpoints and first deployments.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(_) => {
                debug!(table = %self.table, "Jobs table exists");
                return Ok(());
            }
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DescribeTableError::ResourceNotFoundException(_))
                ) => {}
            Err(e) => return Err(classify(e, "describe table")),
        }

        let attr = AttributeDefinition::builder()
            .attribute_name(JOB_ID)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let key = KeySchemaElement::builder()
            .attribute_name(JOB_ID)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.client
            .create_table()
            .table_name(&self.table)
            .attribute_definitions(attr)
            .key_schema(key)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| classify(e, "create table"))?;
        info!(table = %self.table, "Created jobs table");

        self.wait_until_active().await?;

        let ttl = TimeToLiveSpecification::builder()
            .enabled(true)
            .attribute_name(EXPIRATION_TIME)
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Err(e) = self
            .client
            .update_time_to_live()
            .table_name(&self.table)
            .time_to_live_specification(ttl)
            .send()
            .await
        {
            // Some local emulators do not implement TTL.
            warn!(table = %self.table, error = ?e, "Could not enable TTL on jobs table");
        }
        Ok(())
    }

    async fn wait_until_active(&self) -> Result<(), StoreError> {
        for _ in 0..TABLE_ACTIVE_POLLS {
            let resp = self
                .client
                .describe_table()
                .table_name(&self.table)
                .send()
                .await
                .map_err(|e| classify(e, "describe table"))?;
            if resp.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(StoreError::Transient(format!("table {} did not become active", self.table)))
    }
}

#[async_trait]
impl JobStore for DynamoJobStore {
    async fn create_job(
        &self,
        resource_types: BTreeSet<String>,
        total_items: u32,
    ) -> Result<Job, StoreError> {
        let job = Job::new(resource_types, total_items, self.ttl);
        let item = job_to_item(&job)?;

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(job_id)")
            .send()
            .await
            .map_err(|e| classify(e, "put job"))?;

        info!(job_id = %job.job_id, total_items, "Created job");
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let (k, v) = Self::key(job_id);
        let resp = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(k, v)
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify(e, "get job"))?;

        match resp.item() {
            Some(item) => item_to_job(item),
            None => Err(StoreError::NotFound(job_id.to_string())),
        }
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let predecessors = JobStatus::predecessors(status);
        if predecessors.is_empty() {
            // Nothing moves back to Pending; still surface an unknown job.
            self.get_job(job_id).await?;
            return Ok(false);
        }

        let (condition, from_values) = status_condition(predecessors);
        let (k, v) = Self::key(job_id);
        let mut req = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(k, v)
            .update_expression(status_update_expression(status.is_terminal()))
            .condition_expression(condition)
            .expression_attribute_names("#status", attributes::STATUS)
            .expression_attribute_values(":status", string(status.as_str()))
            .expression_attribute_values(":now", num(Utc::now().timestamp()))
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld);
        for (name, value) in from_values {
            req = req.expression_attribute_values(name, value);
        }

        match req.send().await {
            Ok(_) => Ok(true),
            Err(e) => match e.as_service_error() {
                Some(UpdateItemError::ConditionalCheckFailedException(cf)) => match cf.item() {
                    None => Err(StoreError::NotFound(job_id.to_string())),
                    Some(old) => {
                        let (from, ..) = item_progress(old)?;
                        debug!(job_id, from = %from, to = %status, "Ignored status write");
                        Ok(false)
                    }
                },
                _ => Err(classify(e, "update status")),
            },
        }
    }

    async fn update_job_progress(
        &self,
        job_id: &str,
        item_index: u32,
        outcome: &ItemOutcome,
    ) -> Result<ProgressUpdate, StoreError> {
        let result = outcome.record().map(record_to_attr).transpose()?;
        let counter = match outcome {
            ItemOutcome::Succeeded(_) => COMPLETED_ITEMS,
            ItemOutcome::Failed { .. } => FAILED_ITEMS,
        };

        let (k, v) = Self::key(job_id);
        let mut req = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(k, v)
            .update_expression(progress_update_expression(result.is_some()))
            .condition_expression(PROGRESS_CONDITION)
            .expression_attribute_names("#counter", counter)
            .expression_attribute_values(":one", num(1))
            .expression_attribute_values(":idx", num(item_index))
            .expression_attribute_values(
                ":idx_set",
                AttributeValue::Ns(vec![item_index.to_string()]),
            )
            .expression_attribute_values(":now", num(Utc::now().timestamp()))
            .return_values(ReturnValue::AllNew)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld);
        if let Some(result) = result {
            req = req
                .expression_attribute_values(":result", AttributeValue::L(vec![result]))
                .expression_attribute_values(":empty", AttributeValue::L(Vec::new()));
        }

        let new_item: Item = match req.send().await {
            Ok(resp) => resp.attributes.unwrap_or_default(),
            Err(e) => {
                let old = match e.as_service_error() {
                    Some(UpdateItemError::ConditionalCheckFailedException(cf)) => {
                        cf.item().cloned()
                    }
                    _ => return Err(classify(e, "update progress")),
                };
                let Some(old) = old else {
                    return Err(StoreError::NotFound(job_id.to_string()));
                };
                let (status, total_items, completed_items, failed_items) = item_progress(&old)?;
                if item_index >= total_items {
                    return Err(StoreError::InvalidItem {
                        job_id: job_id.to_string(),
                        item_index,
                        total_items,
                    });
                }
                debug!(job_id, item_index, "Duplicate progress write ignored");
                return Ok(ProgressUpdate {
                    applied: false,
                    total_items,
                    completed_items,
                    failed_items,
                    status,
                });
            }
        };

        let (mut status, total_items, completed_items, failed_items) = item_progress(&new_item)?;
        let mut update = ProgressUpdate {
            applied: true,
            total_items,
            completed_items,
            failed_items,
            status,
        };

        // This write made the job converge: finalize it from the counters the
        // atomic update returned, guarded on `status = processing`.
        if update.is_converged() && status == JobStatus::Processing {
            let target = final_status_for(total_items, failed_items);
            if self.update_job_status(job_id, target).await? {
                info!(job_id, status = %target, "Job finalized on last item");
                status = target;
            } else {
                status = self.get_job(job_id).await?.status;
            }
            update.status = status;
        }

        Ok(update)
    }

    fn backend(&self) -> &'static str {
        "dynamodb"
    }
}
