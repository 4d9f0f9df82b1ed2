//! Error types for the Beck storage layer.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corruption: {0}")] Corruption(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
    #[error("not found: {0}")] NotFound(String),
    #[error("invalid argument: {0}")] InvalidArgument(String),
    #[error("database: {0}")] Database(String),
    #[error("shutting down")] ShuttingDown,
}

impl StoreError {
    /// True when a load failed because the backing file is gone, which is
    /// expected for pruned data and should not be logged as fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
