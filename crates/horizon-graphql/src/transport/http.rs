//! Single-request HTTP transport.

use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::response_into_result;

const TARGET: &str = "horizon_graphql::transport";

/// Sends one operation per HTTP POST.
///
/// The default destination for queries and anything the routing table does
/// not claim. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inner: Arc<HttpTransportInner>,
}

#[derive(Debug)]
struct HttpTransportInner {
    http: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Creates the transport against a GraphQL endpoint URL.
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HttpTransportInner {
                http,
                url: url.into(),
            }),
        }
    }

    /// The endpoint URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Executes one operation and parses the response envelope.
    ///
    /// Non-success HTTP statuses and responses carrying GraphQL errors both
    /// surface as failures.
    pub async fn execute(&self, operation: Operation) -> Result<GraphQLResponse> {
        tracing::debug!(
            target: TARGET,
            kind = %operation.operation_type(),
            operation = operation.operation_name.as_deref().unwrap_or("<anonymous>"),
            "sending operation"
        );

        let mut request = self
            .inner
            .http
            .post(&self.inner.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        for (name, value) in &operation.context().headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.json(&operation).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok().filter(|b| !b.is_empty());
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let parsed: GraphQLResponse = serde_json::from_slice(&bytes)?;
        response_into_result(parsed)
    }
}
