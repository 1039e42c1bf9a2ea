//! The operation pipeline.
//!
//! Every operation travels through an ordered chain of links before it
//! reaches a transport. Each link receives the operation plus a handle to
//! the rest of the chain, and decides how to continue: forward as-is,
//! transform headers first, re-run the remainder on failure, or short-circuit.
//! The final link is always a transport stage, which never calls onward.
//!
//! Links hold no hidden references to each other. All the state a stage
//! needs lives in the stage itself, and the rest of the chain is reachable
//! only through the [`NextLink`] handle passed into each call.
//!
//! # Example
//!
//! ```ignore
//! use horizon_graphql::link::{Link, LinkChain, NextLink, OperationOutcome};
//!
//! struct TraceHeader;
//!
//! impl Link for TraceHeader {
//!     fn request(
//!         &self,
//!         mut operation: Operation,
//!         next: NextLink,
//!     ) -> BoxFuture<'static, Result<OperationOutcome>> {
//!         Box::pin(async move {
//!             operation
//!                 .context_mut()
//!                 .headers
//!                 .insert("X-Trace".into(), "1".into());
//!             next.run(operation).await
//!         })
//!     }
//! }
//! ```

mod credential;
mod diagnostic;
mod retry;

pub use credential::{CredentialLink, CredentialProvider, SharedToken, StaticToken};
pub use diagnostic::DiagnosticLink;
pub use retry::{RetryCondition, RetryLink, RetryPolicy};

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{ClientError, Result};
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::SubscriptionStream;

/// What an operation produced once the chain completed.
#[derive(Debug)]
pub enum OperationOutcome {
    /// A single response, from the single or batched transport.
    Single(GraphQLResponse),
    /// A live stream of responses, from the streaming transport.
    Stream(SubscriptionStream),
}

/// A stage in the operation pipeline.
///
/// Implementations must be cheap to share; the chain calls them behind an
/// `Arc` from many tasks at once.
pub trait Link: Send + Sync + 'static {
    /// Processes an operation, forwarding to the rest of the chain through
    /// `next` as many times as the stage requires (zero for transports,
    /// several for retry stages).
    fn request(
        &self,
        operation: Operation,
        next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>>;
}

/// Closures can serve as links, which keeps test chains short.
impl<F> Link for F
where
    F: Fn(Operation, NextLink) -> BoxFuture<'static, Result<OperationOutcome>>
        + Send
        + Sync
        + 'static,
{
    fn request(
        &self,
        operation: Operation,
        next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>> {
        (self)(operation, next)
    }
}

/// Handle to the remainder of a chain, starting after the current stage.
///
/// Running it consumes the handle; stages that forward more than once (retry)
/// clone it first.
#[derive(Clone)]
pub struct NextLink {
    stages: Arc<[Arc<dyn Link>]>,
    index: usize,
}

impl NextLink {
    /// Forwards the operation to the next stage.
    pub fn run(self, operation: Operation) -> BoxFuture<'static, Result<OperationOutcome>> {
        match self.stages.get(self.index) {
            Some(stage) => {
                let stage = Arc::clone(stage);
                let next = NextLink {
                    stages: self.stages,
                    index: self.index + 1,
                };
                stage.request(operation, next)
            }
            None => Box::pin(async {
                Err(ClientError::Request(
                    "link chain ended without reaching a transport".to_string(),
                ))
            }),
        }
    }

    /// How many stages remain after this handle.
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.index)
    }
}

/// An immutable, shareable chain of links.
#[derive(Clone)]
pub struct LinkChain {
    stages: Arc<[Arc<dyn Link>]>,
}

impl LinkChain {
    /// Builds a chain from stages in execution order. The last stage is
    /// expected to be a transport.
    pub fn new(stages: Vec<Arc<dyn Link>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    /// Runs an operation through the full chain.
    pub fn execute(&self, operation: Operation) -> BoxFuture<'static, Result<OperationOutcome>> {
        let entry = NextLink {
            stages: Arc::clone(&self.stages),
            index: 0,
        };
        entry.run(operation)
    }

    /// Number of stages in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn respond_with_headers() -> Arc<dyn Link> {
        Arc::new(
            |operation: Operation, _next: NextLink| -> BoxFuture<'static, Result<OperationOutcome>> {
                Box::pin(async move {
                    let headers: Vec<String> =
                        operation.context().headers.keys().cloned().collect();
                    Ok(OperationOutcome::Single(GraphQLResponse::from_data(
                        json!({ "headers": headers }),
                    )))
                })
            },
        )
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let recorder =
            |label: &'static str, order: Arc<parking_lot::Mutex<Vec<(&'static str, usize)>>>| {
                Arc::new(
                    move |operation: Operation,
                          next: NextLink|
                          -> BoxFuture<'static, Result<OperationOutcome>> {
                        order.lock().push((label, next.remaining()));
                        next.run(operation)
                    },
                ) as Arc<dyn Link>
            };

        let chain = LinkChain::new(vec![
            recorder("first", Arc::clone(&order)),
            recorder("second", Arc::clone(&order)),
            respond_with_headers(),
        ]);
        assert_eq!(chain.len(), 3);

        let outcome = chain.execute(Operation::query("{ ping }")).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Single(_)));
        // each stage's handle counts the stages still ahead of it
        assert_eq!(*order.lock(), vec![("first", 2), ("second", 1)]);
    }

    #[tokio::test]
    async fn test_header_transform_reaches_terminal_stage() {
        let add_header = Arc::new(
            |mut operation: Operation,
             next: NextLink|
             -> BoxFuture<'static, Result<OperationOutcome>> {
                Box::pin(async move {
                    operation
                        .context_mut()
                        .headers
                        .insert("X-Trace".to_string(), "1".to_string());
                    next.run(operation).await
                })
            },
        ) as Arc<dyn Link>;

        let chain = LinkChain::new(vec![add_header, respond_with_headers()]);
        let outcome = chain.execute(Operation::query("{ ping }")).await.unwrap();
        let OperationOutcome::Single(response) = outcome else {
            panic!("expected single response");
        };
        let headers: Vec<String> = response.field(&["headers"]).unwrap();
        assert!(headers.contains(&"X-Trace".to_string()));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_stages() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = Arc::clone(&reached);

        let refuse = Arc::new(
            |_operation: Operation,
             _next: NextLink|
             -> BoxFuture<'static, Result<OperationOutcome>> {
                Box::pin(async { Err(ClientError::Request("refused".to_string())) })
            },
        ) as Arc<dyn Link>;

        let counter = Arc::new(
            move |operation: Operation,
                  next: NextLink|
                  -> BoxFuture<'static, Result<OperationOutcome>> {
                reached_clone.fetch_add(1, Ordering::SeqCst);
                next.run(operation)
            },
        ) as Arc<dyn Link>;

        let chain = LinkChain::new(vec![refuse, counter, respond_with_headers()]);
        let result = chain.execute(Operation::query("{ ping }")).await;
        assert!(result.is_err());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_is_a_request_error() {
        let chain = LinkChain::new(Vec::new());
        assert!(chain.is_empty());
        let result = chain.execute(Operation::query("{ ping }")).await;
        assert!(matches!(result, Err(ClientError::Request(_))));
    }
}
