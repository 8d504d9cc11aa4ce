//! Transport error types

use helperconn::ConnError;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while sending a request through a helper
#[derive(Error, Debug)]
pub enum TransportError {
    /// Dialing or talking to the helper failed
    #[error("connection error: {0}")]
    Connection(#[from] ConnError),

    /// The HTTP exchange itself failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// The request could not be turned into an HTTP message
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request did not complete within the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Body (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `close` was called on the transport
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Whether the caller may retry the whole request on a fresh connection
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(err) => err.is_retriable(),
            Self::Timeout => true,
            _ => false,
        }
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<http::Error> for TransportError {
    fn from(err: http::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
