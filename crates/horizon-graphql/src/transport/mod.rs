//! Transports and the routing stage that picks between them.
//!
//! Three transports carry operations to the server: a single-request HTTP
//! transport, a batching HTTP transport that coalesces operations inside a
//! short window, and a streaming WebSocket transport for subscriptions.
//! [`TransportRouter`] is the terminal pipeline stage that consults a
//! [`RoutingTable`] and hands each operation to one of them.

mod batch;
mod http;
mod router;
mod streaming;

pub use batch::{BatchConfig, BatchTransport};
pub use http::HttpTransport;
pub use router::{Route, RoutingTable, TransportRouter};
pub use streaming::{
    KeepAliveConfig, StreamingConfig, StreamingTransport, SubscriptionMessage, SubscriptionStream,
};

use crate::error::{ClientError, Result};
use crate::response::GraphQLResponse;

/// The transport families an operation can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// The WebSocket transport, for long-lived result streams.
    Streaming,
    /// The batching HTTP transport.
    Batched,
    /// The single-request HTTP transport.
    Single,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Batched => write!(f, "batched"),
            Self::Single => write!(f, "single"),
        }
    }
}

/// Converts a parsed response into the pipeline's result shape.
///
/// Responses carrying GraphQL errors become data-layer failures here, below
/// the retry stages, so those stages treat them like any other failure.
pub(crate) fn response_into_result(response: GraphQLResponse) -> Result<GraphQLResponse> {
    if response.has_errors() {
        Err(ClientError::Graphql { response })
    } else {
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_bearing_response_becomes_failure() {
        let response: GraphQLResponse = serde_json::from_value(json!({
            "data": {"partial": true},
            "errors": [{"message": "broken"}]
        }))
        .unwrap();

        let err = response_into_result(response).unwrap_err();
        let carried = err.response().unwrap();
        assert!(carried.raw_data().is_some());
        assert_eq!(carried.error_message().unwrap(), "broken");
    }

    #[test]
    fn test_clean_response_passes() {
        let response = GraphQLResponse::from_data(json!({"ok": true}));
        assert!(response_into_result(response).is_ok());
    }
}
