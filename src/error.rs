//! Error types for the transfer_http crate.
//!
//! Only misuse and preparation problems surface as [`Error`]. Failures of the
//! exchange itself (transport errors, 4xx/5xx statuses) are recorded on the
//! request's [`ErrorState`](crate::types::ErrorState) instead, so a failing
//! exchange never aborts a batch.

use crate::types::LifecycleState;

/// Errors produced while building or driving a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transfer engine could not be created.
    #[error("transfer engine unavailable: {0}")]
    TransportUnavailable(String),

    /// The request URL could not be parsed or joined.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The payload could not be serialized as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("cannot {operation} while request is {state:?}")]
    InvalidState {
        /// State the request was in.
        state: LifecycleState,
        /// Operation that was rejected.
        operation: &'static str,
    },

    /// A header line or header value was malformed.
    #[error("header parse error: {0}")]
    HeaderParse(String),

    /// Local I/O failure (e.g. inspecting a file upload reference).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
