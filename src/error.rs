use http::StatusCode;
use thiserror::Error;

use crate::ledger::models::PaymentSource;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Peer reconciliation error: {0}")]
    Peer(#[from] PeerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Status written back to the client when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transport failures on the client socket leave nothing to answer.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AppError::Io(_))
    }
}

/// Downstream payment-processor errors
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Processor answered with status {0}")]
    Status(u16),

    #[error("Malformed processor response: {0}")]
    MalformedResponse(String),
}

/// Errors raised while turning an ingested payload into a recorded payment
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Invalid payment payload: {0}")]
    InvalidPayload(String),

    #[error("Dispatch to {processor:?} processor failed: {error}")]
    Dispatch {
        processor: PaymentSource,
        #[source]
        error: ProcessorError,
    },
}

impl PaymentError {
    /// Only dispatch failures go back to the retry queue; a payload that
    /// cannot be parsed now will never parse.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::Dispatch { .. })
    }
}

/// Sibling-instance summary errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer answered with status {0}")]
    Status(u16),

    #[error("Peer summary could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
