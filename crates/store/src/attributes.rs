//! Conversion between [`Job`] records and DynamoDB attribute maps.
//!
//! Results are written as native DynamoDB maps built from the canonical
//! [`ResultRecord`] JSON, so there is exactly one encoding to read back.

use std::collections::{BTreeSet, HashMap};

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Number, Value};

use greenops_core::{Job, JobStatus, ResultRecord};

use crate::error::StoreError;

pub type Item = HashMap<String, AttributeValue>;

pub const JOB_ID: &str = "job_id";
pub const STATUS: &str = "status";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const COMPLETED_AT: &str = "completed_at";
pub const TOTAL_ITEMS: &str = "total_items";
pub const COMPLETED_ITEMS: &str = "completed_items";
pub const FAILED_ITEMS: &str = "failed_items";
pub const RESULTS: &str = "results";
pub const RESOURCE_TYPES: &str = "resource_types";
pub const EXPIRATION_TIME: &str = "expiration_time";
/// Number set of item indices already recorded (the idempotency keys).
pub const PROCESSED_ITEMS: &str = "processed_items";

pub fn num(n: impl ToString) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

pub fn string(s: impl Into<String>) -> AttributeValue {
    AttributeValue::S(s.into())
}

// ── JSON <-> AttributeValue ──────────────────────────────────────

/// Encode a JSON value as a DynamoDB attribute.
pub fn json_to_attr(value: &Value) -> Result<AttributeValue, StoreError> {
    Ok(match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(StoreError::Encoding(format!("non-finite number {n}")));
            }
            AttributeValue::N(n.to_string())
        }
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => {
            AttributeValue::L(items.iter().map(json_to_attr).collect::<Result<_, _>>()?)
        }
        Value::Object(fields) => AttributeValue::M(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_to_attr(v)?)))
                .collect::<Result<_, StoreError>>()?,
        ),
    })
}

fn parse_number(raw: &str) -> Result<Value, StoreError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Ok(Value::Number(u.into()));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StoreError::Encoding(format!("unparseable number {raw:?}")))
}

/// Decode a DynamoDB attribute back into JSON.
pub fn attr_to_json(attr: &AttributeValue) -> Result<Value, StoreError> {
    Ok(match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => parse_number(n)?,
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::L(items) => {
            Value::Array(items.iter().map(attr_to_json).collect::<Result<_, _>>()?)
        }
        AttributeValue::M(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), attr_to_json(v)?);
            }
            Value::Object(map)
        }
        AttributeValue::Ss(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::Ns(items) => {
            Value::Array(items.iter().map(|n| parse_number(n)).collect::<Result<_, _>>()?)
        }
        other => return Err(StoreError::Encoding(format!("unsupported attribute {other:?}"))),
    })
}

/// Encode one result record as a DynamoDB map.
pub fn record_to_attr(record: &ResultRecord) -> Result<AttributeValue, StoreError> {
    if let Some(field) = record.first_non_finite() {
        return Err(StoreError::Encoding(format!("{field} is not finite")));
    }
    let value = serde_json::to_value(record).map_err(|e| StoreError::Encoding(e.to_string()))?;
    json_to_attr(&value)
}

pub fn attr_to_record(attr: &AttributeValue) -> Result<ResultRecord, StoreError> {
    serde_json::from_value(attr_to_json(attr)?).map_err(|e| StoreError::Encoding(e.to_string()))
}

// ── Job <-> Item ─────────────────────────────────────────────────

fn timestamp(dt: DateTime<Utc>) -> AttributeValue {
    num(dt.timestamp())
}

/// Full item for a freshly created job. `processed_items` is left absent:
/// DynamoDB sets cannot be empty, and `ADD` creates it on first use.
pub fn job_to_item(job: &Job) -> Result<Item, StoreError> {
    let mut item = Item::new();
    item.insert(JOB_ID.into(), string(&job.job_id));
    item.insert(STATUS.into(), string(job.status.as_str()));
    item.insert(CREATED_AT.into(), timestamp(job.created_at));
    item.insert(UPDATED_AT.into(), timestamp(job.updated_at));
    if let Some(done) = job.completed_at {
        item.insert(COMPLETED_AT.into(), timestamp(done));
    }
    item.insert(TOTAL_ITEMS.into(), num(job.total_items));
    item.insert(COMPLETED_ITEMS.into(), num(job.completed_items));
    item.insert(FAILED_ITEMS.into(), num(job.failed_items));
    item.insert(
        RESULTS.into(),
        AttributeValue::L(job.results.iter().map(record_to_attr).collect::<Result<_, _>>()?),
    );
    item.insert(
        RESOURCE_TYPES.into(),
        AttributeValue::L(job.resource_types.iter().map(string).collect()),
    );
    item.insert(EXPIRATION_TIME.into(), num(job.expiration_time));
    Ok(item)
}

fn get_str<'a>(item: &'a Item, key: &str) -> Result<&'a str, StoreError> {
    match item.get(key) {
        Some(AttributeValue::S(s)) => Ok(s),
        _ => Err(StoreError::Encoding(format!("missing or non-string attribute {key}"))),
    }
}

fn get_i64(item: &Item, key: &str) -> Result<Option<i64>, StoreError> {
    match item.get(key) {
        None | Some(AttributeValue::Null(_)) => Ok(None),
        Some(AttributeValue::N(n)) => n
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::Encoding(format!("attribute {key}: {e}"))),
        Some(_) => Err(StoreError::Encoding(format!("attribute {key} is not a number"))),
    }
}

fn get_u32(item: &Item, key: &str) -> Result<u32, StoreError> {
    let raw = get_i64(item, key)?.unwrap_or(0);
    u32::try_from(raw)
        .map_err(|_| StoreError::Encoding(format!("attribute {key} out of range: {raw}")))
}

fn get_time(item: &Item, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(get_i64(item, key)?.and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
}

/// Status and counters only; cheap to decode from `ALL_NEW` responses.
pub fn item_progress(item: &Item) -> Result<(JobStatus, u32, u32, u32), StoreError> {
    let status: JobStatus = get_str(item, STATUS)?
        .parse()
        .map_err(|e: greenops_core::GreenopsError| StoreError::Encoding(e.to_string()))?;
    Ok((
        status,
        get_u32(item, TOTAL_ITEMS)?,
        get_u32(item, COMPLETED_ITEMS)?,
        get_u32(item, FAILED_ITEMS)?,
    ))
}

pub fn item_to_job(item: &Item) -> Result<Job, StoreError> {
    let (status, total_items, completed_items, failed_items) = item_progress(item)?;

    let results = match item.get(RESULTS) {
        Some(AttributeValue::L(list)) => list.iter().map(attr_to_record).collect::<Result<_, _>>()?,
        None | Some(AttributeValue::Null(_)) => Vec::new(),
        Some(_) => return Err(StoreError::Encoding("results is not a list".into())),
    };

    let resource_types: BTreeSet<String> = match item.get(RESOURCE_TYPES) {
        Some(AttributeValue::L(list)) => list
            .iter()
            .filter_map(|a| match a {
                AttributeValue::S(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        Some(AttributeValue::Ss(set)) => set.iter().cloned().collect(),
        _ => BTreeSet::new(),
    };

    let created_at = get_time(item, CREATED_AT)?.unwrap_or_else(Utc::now);
    Ok(Job {
        job_id: get_str(item, JOB_ID)?.to_string(),
        status,
        created_at,
        updated_at: get_time(item, UPDATED_AT)?.unwrap_or(created_at),
        completed_at: get_time(item, COMPLETED_AT)?,
        total_items,
        completed_items,
        failed_items,
        results,
        resource_types,
        expiration_time: get_i64(item, EXPIRATION_TIME)?.unwrap_or_default(),
    })
}
