//! Error types for rangedl core

use rangedl_types::TransferStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in rangedl core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Cannot {command} a transfer that is {from}")]
    InvalidTransition {
        from: TransferStatus,
        command: &'static str,
    },

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl EngineError {
    /// Connect/read failures and 5xx answers may succeed on a later tick
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Destination unwritable, disk full and similar local failures
    pub fn is_resource(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }

    /// Short label for logs: `transient`, `resource` or `permanent`
    pub fn class(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else if self.is_resource() {
            "resource"
        } else {
            "permanent"
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
