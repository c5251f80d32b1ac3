pub mod config;
pub mod error;
pub mod item;
pub mod job;

pub use config::Config;
pub use error::*;
pub use item::*;
pub use job::*;
