//! Crate-wide error type: a flat `thiserror` enum with one variant per
//! failure class and `#[from]`-style conversions at the transport
//! boundary.

use thiserror::Error;

use crate::client::ClientError;

pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors surfaced by `fetch_all_datapoints` and the query validator.
///
/// Cancellation is deliberately absent from this enum: per the engine's
/// concurrency contract, a cancelled subtask is an internal bookkeeping
/// event filtered out at the scheduler and never becomes user-visible.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid query: {0}")]
    Validation(String),

    /// Raised once, aggregating every missing identifier across every
    /// query that set `ignore_unknown_ids = false`.
    #[error("time series not found: {0:?}")]
    NotFound(Vec<String>),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
}

impl From<ClientError> for FetchError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(msg) => FetchError::Transport(msg),
            ClientError::Status { status, message } => FetchError::Server { status, message },
            ClientError::MissingIdentifiers(ids) => FetchError::NotFound(ids),
        }
    }
}
