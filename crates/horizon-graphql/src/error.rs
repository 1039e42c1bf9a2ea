//! Error types for the GraphQL client.

use thiserror::Error;

use crate::response::GraphQLResponse;

/// Errors produced by the client pipeline and its transports.
///
/// The enum is `Clone` so a single transport failure can be delivered to
/// every operation waiting on the same batch.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection-level failure (refused, reset, DNS, socket I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Invalid URL provided.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid header name or value.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Malformed request or client misuse.
    #[error("request error: {0}")]
    Request(String),

    /// Server answered with a non-success HTTP status.
    #[error("HTTP {status}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// Response body, when one was readable.
        body: Option<String>,
    },

    /// The server executed the operation and returned structured errors.
    ///
    /// The full response is carried so callers can still reach partial data
    /// after retries are exhausted.
    #[error("operation returned {} GraphQL error(s)", .response.errors.len())]
    Graphql {
        /// The response as received, errors included.
        response: GraphQLResponse,
    },

    /// WebSocket error on the streaming transport.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A cache-only fetch found no cached response.
    #[error("no cached response for operation")]
    CacheMiss,

    /// Internal reply channel closed before a result was delivered.
    #[error("response channel closed before a result was delivered")]
    ChannelClosed,
}

impl ClientError {
    /// Whether this failure classifies as an authorization failure (HTTP 401).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401, .. })
    }

    /// The HTTP status code, for status-bearing failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The server response carried by a data-layer failure.
    pub fn response(&self) -> Option<&GraphQLResponse> {
        match self {
            Self::Graphql { response } => Some(response),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for ClientError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for ClientError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

/// A specialized Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
