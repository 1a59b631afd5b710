//! The error vocabulary the rest of the crate is built on.
//!
//! `BrokerError` is the closed set the Broker Port and Sizer return explicitly; controllers
//! pattern-match on its variants instead of downcasting an opaque error object.
//! `StoreError` distinguishes a plain query failure from an idempotence/constraint outcome.
//! `AppError` is only used at the process boundary (config load, Store open, fatal shutdown).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker rejected request: {0}")]
    Validation(String),

    /// The adapter asked the broker for an order type it should have translated away. Seeing
    /// this means the adapter has a bug, not that the caller did anything wrong.
    #[error("order type not supported by broker: {0}")]
    NotSupported(String),

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("quote is stale")]
    StaleData,

    #[error("conflicting broker state: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Used only at the process boundary; business logic never returns this.
pub type AppError = anyhow::Error;
