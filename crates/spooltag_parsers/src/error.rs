//! Inventory error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, InventoryError>;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Inventory request failed: {0}")]
    Request(String),

    #[error("Inventory returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected inventory response: {0}")]
    InvalidResponse(String),

    #[error("Spool {0} not found")]
    SpoolNotFound(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InventoryError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::Request(_) => true,
            InventoryError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
