//! Durable job records with atomic progress counters.
//!
//! [`JobStore`] is the only way the rest of the system touches a job: no
//! caller ever reads a counter, bumps it locally and writes it back.

pub mod attributes;
pub mod dynamo;
pub mod error;
pub mod memory;
pub mod store;

pub use dynamo::DynamoJobStore;
pub use error::StoreError;
pub use memory::MemoryJobStore;
pub use store::JobStore;

use std::sync::Arc;

use greenops_core::config::{AwsConfig, StoreBackend, StoreConfig};

/// Build the configured store backend.
pub async fn connect(
    aws: &AwsConfig,
    config: &StoreConfig,
) -> Result<Arc<dyn JobStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new(config.ttl()))),
        StoreBackend::DynamoDb => {
            let store = DynamoJobStore::new(aws, config).await?;
            store.ensure_table().await?;
            Ok(Arc::new(store))
        }
    }
}
