//! Main Crate Error

use crate::common::Status;
use crate::rpc::TransportError;
use crate::store::StorageError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    /// Malformed or mismatched-length identifier, rejected locally.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Unknown request or response `type` field. The message is dropped.
    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    /// Known message type with missing or invalid fields.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No response arrived within the request timeout.
    #[error("Request {correlation_id} timed out")]
    Timeout {
        /// Correlation id of the abandoned request.
        correlation_id: String,
    },

    /// The remote node answered, but with a status other than `ok`.
    #[error("Request rejected with status {0:?}")]
    Rejected(Status),

    #[error(transparent)]
    /// Transparent [TransportError]
    Transport(#[from] TransportError),

    #[error(transparent)]
    /// Transparent [StorageError]
    Storage(#[from] StorageError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Errors related to encoding messages.
    #[error("Failed to encode message: {0}")]
    Json(#[from] serde_json::Error),

    /// The node was dropped while a request was pending.
    #[error("Dht node was shutdown")]
    DhtWasShutdown,
}

/// Alias for `Result<T, kadnode::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
