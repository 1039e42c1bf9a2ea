//! GraphQL client pipeline for Horizon applications.
//!
//! Every operation runs through an ordered chain of links: credential
//! attachment, failure diagnostics, a general retry stage, an authorization
//! retry stage, and finally a router that picks one of three transports.
//! Subscriptions go out over a shared WebSocket connection with keep-alive
//! probing and automatic reconnection; batch-hinted mutations coalesce into
//! windowed JSON-array requests; everything else is a single HTTP POST.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use horizon_graphql::{Client, Operation, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> horizon_graphql::Result<()> {
//!     let client = Client::builder("https://api.example.com/graphql")
//!         .credentials(Arc::new(StaticToken::new("token")))
//!         .build()?;
//!
//!     // single request
//!     let viewer: serde_json::Value = client.query("{ viewer { name } }").await?;
//!
//!     // batched mutation
//!     let response = client
//!         .execute(Operation::mutation("mutation { bump }").batched())
//!         .await?;
//!
//!     // subscription over the shared WebSocket connection
//!     let mut stream = client
//!         .subscribe(Operation::subscription("subscription { tick }"))
//!         .await?;
//!     while let Some(message) = stream.next().await {
//!         println!("{message:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod error;
pub mod link;
mod operation;
mod response;
pub mod transport;

pub use cache::{DefaultOptions, FetchPolicy, QueryCache, WatchQueryOptions};
pub use client::{Client, ClientBuilder, QueryUpdate, UpdateSource, WatchedQuery};
pub use error::{ClientError, Result};
pub use link::{
    CredentialProvider, Link, LinkChain, NextLink, OperationOutcome, RetryCondition, RetryPolicy,
    SharedToken, StaticToken,
};
pub use operation::{Operation, OperationContext, OperationType};
pub use response::{GraphQLError, GraphQLLocation, GraphQLResponse, PathSegment};
pub use transport::{
    BatchConfig, KeepAliveConfig, RoutingTable, StreamingConfig, SubscriptionMessage,
    SubscriptionStream, TransportKind,
};
