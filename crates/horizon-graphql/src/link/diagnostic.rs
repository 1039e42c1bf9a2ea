//! Failure logging.

use futures_util::future::BoxFuture;

use crate::error::{ClientError, Result};
use crate::link::{Link, NextLink, OperationOutcome};
use crate::operation::Operation;

const TARGET: &str = "horizon_graphql::diagnostic";

/// Pipeline stage that logs failures flowing back up the chain.
///
/// Sits above the retry stages, so it reports only failures that survived
/// every retry. Data-layer failures are logged once per server error with
/// the message, error code, and any partial data the server still returned;
/// transport failures are logged with the failure itself. Outcomes pass
/// through unchanged either way.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticLink;

impl DiagnosticLink {
    /// Creates the stage.
    pub fn new() -> Self {
        Self
    }
}

impl Link for DiagnosticLink {
    fn request(
        &self,
        operation: Operation,
        next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>> {
        Box::pin(async move {
            let name = operation
                .operation_name
                .clone()
                .unwrap_or_else(|| "<anonymous>".to_string());
            let kind = operation.operation_type();

            let result = next.run(operation).await;
            if let Err(error) = &result {
                log_failure(&name, kind, error);
            }
            result
        })
    }
}

fn log_failure(operation: &str, kind: crate::operation::OperationType, error: &ClientError) {
    match error {
        ClientError::Graphql { response } => {
            let partial = response
                .raw_data()
                .and_then(|data| serde_json::to_string(data).ok())
                .unwrap_or_default();
            for graphql_error in &response.errors {
                tracing::error!(
                    target: TARGET,
                    operation,
                    %kind,
                    message = %graphql_error.message,
                    code = graphql_error.code().unwrap_or("unknown"),
                    partial = %partial,
                    "GraphQL error"
                );
            }
        }
        ClientError::HttpStatus { status, body } => {
            tracing::error!(
                target: TARGET,
                operation,
                %kind,
                status,
                body = body.as_deref().unwrap_or(""),
                "operation failed"
            );
        }
        other => {
            tracing::error!(
                target: TARGET,
                operation,
                %kind,
                error = %other,
                "operation failed"
            );
        }
    }
}
