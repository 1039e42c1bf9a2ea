//! Transport selection.

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::link::{Link, NextLink, OperationOutcome};
use crate::operation::{Operation, OperationType};
use crate::transport::{BatchTransport, HttpTransport, StreamingTransport, TransportKind};

const TARGET: &str = "horizon_graphql::transport";

/// One prioritized routing rule.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    /// Name used in route diagnostics.
    pub name: &'static str,
    /// Predicate over the operation. Plain function pointers keep rules
    /// introspectable and free of captured state.
    pub matches: fn(&Operation) -> bool,
    /// Destination when the predicate holds.
    pub destination: TransportKind,
}

/// Prioritized routing rules with a fallback destination.
///
/// Rules are consulted in order; the first whose predicate holds wins.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
    fallback: TransportKind,
}

impl RoutingTable {
    /// Builds a table from rules in priority order.
    pub fn new(routes: Vec<Route>, fallback: TransportKind) -> Self {
        Self { routes, fallback }
    }

    /// The standard table: subscriptions stream, batch-hinted mutations
    /// batch, everything else goes out as single requests. A batch-hinted
    /// query still goes out single.
    pub fn standard() -> Self {
        Self::new(
            vec![
                Route {
                    name: "subscriptions",
                    matches: |op| op.operation_type() == OperationType::Subscription,
                    destination: TransportKind::Streaming,
                },
                Route {
                    name: "batched-mutations",
                    matches: |op| {
                        op.operation_type() == OperationType::Mutation && op.context().batch
                    },
                    destination: TransportKind::Batched,
                },
            ],
            TransportKind::Single,
        )
    }

    /// Picks the destination for an operation.
    pub fn destination(&self, operation: &Operation) -> TransportKind {
        for route in &self.routes {
            if (route.matches)(operation) {
                return route.destination;
            }
        }
        self.fallback
    }

    /// The rules in priority order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// The fallback destination.
    pub fn fallback(&self) -> TransportKind {
        self.fallback
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Terminal pipeline stage: routes each operation to a transport.
///
/// Never forwards to a next stage.
pub struct TransportRouter {
    table: RoutingTable,
    streaming: StreamingTransport,
    batched: BatchTransport,
    single: HttpTransport,
}

impl TransportRouter {
    /// Creates the router over the three transports.
    pub fn new(
        table: RoutingTable,
        streaming: StreamingTransport,
        batched: BatchTransport,
        single: HttpTransport,
    ) -> Self {
        Self {
            table,
            streaming,
            batched,
            single,
        }
    }

    /// The routing table in force.
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }
}

impl Link for TransportRouter {
    fn request(
        &self,
        operation: Operation,
        _next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>> {
        let destination = self.table.destination(&operation);
        tracing::trace!(
            target: TARGET,
            %destination,
            kind = %operation.operation_type(),
            "routing operation"
        );
        match destination {
            TransportKind::Streaming => {
                let transport = self.streaming.clone();
                Box::pin(async move {
                    transport
                        .subscribe(operation)
                        .await
                        .map(OperationOutcome::Stream)
                })
            }
            TransportKind::Batched => {
                let transport = self.batched.clone();
                Box::pin(async move {
                    transport
                        .execute(operation)
                        .await
                        .map(OperationOutcome::Single)
                })
            }
            TransportKind::Single => {
                let transport = self.single.clone();
                Box::pin(async move {
                    transport
                        .execute(operation)
                        .await
                        .map(OperationOutcome::Single)
                })
            }
        }
    }
}
