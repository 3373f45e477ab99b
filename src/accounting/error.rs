//! Accounting error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("unknown ticket class: {0}")]
    UnknownClass(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transfer batcher shut down")]
    BatcherClosed,
}

impl AccountingError {
    /// Stable error code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            AccountingError::UnknownClass(_) => "UNKNOWN_CLASS",
            AccountingError::UnknownResource(_) => "UNKNOWN_RESOURCE",
            AccountingError::Transport(_) => "LEDGER_TRANSPORT",
            AccountingError::Rejected(_) => "LEDGER_REJECTED",
            AccountingError::Database(_) => "DATABASE_ERROR",
            AccountingError::BatcherClosed => "BATCHER_CLOSED",
        }
    }
}
