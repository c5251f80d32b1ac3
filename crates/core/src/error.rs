use thiserror::Error;

#[derive(Error, Debug)]
pub enum GreenopsError {
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
}
