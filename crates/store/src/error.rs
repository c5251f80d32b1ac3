//! Job store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    /// The store could not be reached or throttled us; the caller may retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// A result could not be serialized into the store's format.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("item {item_index} out of range for job {job_id} ({total_items} items)")]
    InvalidItem {
        job_id: String,
        item_index: u32,
        total_items: u32,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
