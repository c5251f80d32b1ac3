pub mod codec;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod producer;
pub mod sqs;

pub use codec::{decode_work_item, encode_work_item};
pub use consumer::{QueueConsumer, QueueHealth, QueueMessage};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use producer::QueueProducer;
pub use sqs::SqsQueue;
