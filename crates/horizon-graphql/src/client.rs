//! The assembled GraphQL client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{DefaultOptions, FetchPolicy, QueryCache, WatchQueryOptions};
use crate::error::{ClientError, Result};
use crate::link::{
    CredentialLink, CredentialProvider, DiagnosticLink, Link, LinkChain, OperationOutcome,
    RetryLink, RetryPolicy, StaticToken,
};
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::{
    BatchConfig, BatchTransport, HttpTransport, KeepAliveConfig, RoutingTable, StreamingConfig,
    StreamingTransport, SubscriptionStream, TransportRouter,
};

/// Builder for [`Client`].
pub struct ClientBuilder {
    url: String,
    websocket_url: Option<String>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    retry_policy: RetryPolicy,
    auth_retry_policy: RetryPolicy,
    batch: BatchConfig,
    keep_alive: KeepAliveConfig,
    reconnect_delay: Duration,
    connection_timeout: Duration,
    request_timeout: Duration,
    default_options: DefaultOptions,
    routing: RoutingTable,
    default_headers: HashMap<String, String>,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            websocket_url: None,
            credentials: None,
            retry_policy: RetryPolicy::default(),
            auth_retry_policy: RetryPolicy::unauthorized(),
            batch: BatchConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            reconnect_delay: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            default_options: DefaultOptions::default(),
            routing: RoutingTable::standard(),
            default_headers: HashMap::new(),
        }
    }

    /// Overrides the WebSocket URL. By default it is derived from the HTTP
    /// URL by swapping the scheme.
    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = Some(url.into());
        self
    }

    /// Sets the credential provider. Without one the client stays anonymous.
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Replaces the general retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Replaces the authorization retry policy.
    pub fn auth_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.auth_retry_policy = policy;
        self
    }

    /// Replaces the batching window limits.
    pub fn batch_config(mut self, config: BatchConfig) -> Self {
        self.batch = config;
        self
    }

    /// Replaces the keep-alive probing settings.
    pub fn keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = config;
        self
    }

    /// Sets the pause between streaming reconnection attempts.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the WebSocket handshake timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the per-request HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Replaces the client-wide default options.
    pub fn default_options(mut self, options: DefaultOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Replaces the routing table.
    pub fn routing_table(mut self, table: RoutingTable) -> Self {
        self.routing = table;
        self
    }

    /// Adds a header sent with every operation. Per-operation headers win
    /// on conflict.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Builds the client, assembling the standard pipeline.
    pub fn build(self) -> Result<Client> {
        url::Url::parse(&self.url)?;
        let websocket_url = self
            .websocket_url
            .unwrap_or_else(|| http_to_ws_url(&self.url));

        let credentials: Arc<dyn CredentialProvider> = self
            .credentials
            .unwrap_or_else(|| Arc::new(StaticToken::anonymous()));

        let http = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?;

        let single = HttpTransport::new(http.clone(), &self.url);
        let batched = BatchTransport::new(http, &self.url, self.batch);
        let streaming = StreamingTransport::new(
            StreamingConfig {
                url: websocket_url.clone(),
                connection_timeout: self.connection_timeout,
                reconnect_delay: self.reconnect_delay,
                keep_alive: self.keep_alive,
            },
            Arc::clone(&credentials),
        );
        let router = TransportRouter::new(self.routing, streaming, batched, single);

        // credential first, diagnostics above the retries so only final
        // failures are logged, authorization retry closest to the transport
        let stages: Vec<Arc<dyn Link>> = vec![
            Arc::new(CredentialLink::new(credentials)),
            Arc::new(DiagnosticLink::new()),
            Arc::new(RetryLink::new(self.retry_policy)),
            Arc::new(RetryLink::new(self.auth_retry_policy)),
            Arc::new(router),
        ];

        Ok(Client {
            inner: Arc::new(ClientInner {
                chain: LinkChain::new(stages),
                cache: QueryCache::new(),
                default_options: self.default_options,
                default_headers: self.default_headers,
                url: self.url,
                websocket_url,
            }),
        })
    }
}

/// A GraphQL client with credential attachment, failure diagnostics,
/// retries, and transport routing built in.
///
/// Cheap to clone; clones share the pipeline, connection pools, and cache.
///
/// # Example
///
/// ```ignore
/// let client = Client::builder("https://api.example.com/graphql")
///     .credentials(Arc::new(StaticToken::new("token")))
///     .build()?;
///
/// let response = client.execute(Operation::query("{ viewer { name } }")).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    chain: LinkChain,
    cache: QueryCache,
    default_options: DefaultOptions,
    default_headers: HashMap<String, String>,
    url: String,
    websocket_url: String,
}

impl Client {
    /// Creates a client with default settings.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).build()
    }

    /// Starts building a client against a GraphQL endpoint URL.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// The HTTP endpoint URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The WebSocket endpoint URL.
    pub fn websocket_url(&self) -> &str {
        &self.inner.websocket_url
    }

    /// The query cache.
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// The client-wide default options.
    pub fn default_options(&self) -> &DefaultOptions {
        &self.inner.default_options
    }

    /// Runs a query or mutation through the pipeline.
    ///
    /// Does not consult the query cache; see [`watch`](Self::watch) for the
    /// cache-aware surface. Responses carrying GraphQL errors surface as
    /// [`ClientError::Graphql`] failures.
    pub async fn execute(&self, operation: Operation) -> Result<GraphQLResponse> {
        if operation.is_subscription() {
            return Err(ClientError::Request(
                "use subscribe() for subscription operations".to_string(),
            ));
        }
        match self.dispatch(operation).await? {
            OperationOutcome::Single(response) => Ok(response),
            OperationOutcome::Stream(_) => Err(ClientError::Request(
                "routing table sent a request operation to the streaming transport".to_string(),
            )),
        }
    }

    /// Starts a subscription through the pipeline.
    pub async fn subscribe(&self, operation: Operation) -> Result<SubscriptionStream> {
        if !operation.is_subscription() {
            return Err(ClientError::Request(
                "subscribe() requires a subscription operation".to_string(),
            ));
        }
        match self.dispatch(operation).await? {
            OperationOutcome::Stream(stream) => Ok(stream),
            OperationOutcome::Single(_) => Err(ClientError::Request(
                "routing table sent a subscription to a request transport".to_string(),
            )),
        }
    }

    /// Executes a query and deserializes the data.
    pub async fn query<T: DeserializeOwned>(&self, document: impl Into<String>) -> Result<T> {
        self.execute(Operation::query(document)).await?.data()
    }

    /// Executes a query with variables and deserializes the data.
    pub async fn query_with_variables<T: DeserializeOwned>(
        &self,
        document: impl Into<String>,
        variables: impl Serialize,
    ) -> Result<T> {
        self.execute(Operation::query(document).variables(variables))
            .await?
            .data()
    }

    /// Executes a mutation and deserializes the data.
    pub async fn mutate<T: DeserializeOwned>(&self, document: impl Into<String>) -> Result<T> {
        self.execute(Operation::mutation(document)).await?.data()
    }

    /// Executes a mutation with variables and deserializes the data.
    pub async fn mutate_with_variables<T: DeserializeOwned>(
        &self,
        document: impl Into<String>,
        variables: impl Serialize,
    ) -> Result<T> {
        self.execute(Operation::mutation(document).variables(variables))
            .await?
            .data()
    }

    /// Watches a query under the client's default options.
    pub fn watch(&self, operation: Operation) -> WatchedQuery {
        self.watch_with_options(operation, self.inner.default_options.watch_query.clone())
    }

    /// Watches a query under explicit options.
    pub fn watch_with_options(
        &self,
        operation: Operation,
        options: WatchQueryOptions,
    ) -> WatchedQuery {
        WatchedQuery {
            client: self.clone(),
            operation,
            options,
            stage: WatchStage::Initial,
        }
    }

    async fn dispatch(&self, mut operation: Operation) -> Result<OperationOutcome> {
        for (name, value) in &self.inner.default_headers {
            operation
                .context_mut()
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self.inner.chain.execute(operation).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("websocket_url", &self.inner.websocket_url)
            .finish()
    }
}

/// Where a query update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Served from the query cache.
    Cache,
    /// Fetched over the network.
    Network,
}

/// One update delivered to a watched query.
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    /// Where the data came from.
    pub source: UpdateSource,
    /// The response.
    pub response: GraphQLResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchStage {
    Initial,
    CacheServed,
    Settled,
}

/// A query whose result is served against the cache and kept fresh on
/// request.
///
/// Under the default options the initial [`next`](Self::next) serves cached
/// data when present and a second call refreshes from the network; a cold
/// cache goes straight to the network. Later [`refetch`](Self::refetch)
/// calls follow the follow-up policy, cache-first by default.
pub struct WatchedQuery {
    client: Client,
    operation: Operation,
    options: WatchQueryOptions,
    stage: WatchStage,
}

impl WatchedQuery {
    /// The operation being watched.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The options in force.
    pub fn options(&self) -> &WatchQueryOptions {
        &self.options
    }

    /// The next update of the initial fetch, or `None` once it settled.
    pub async fn next(&mut self) -> Option<Result<QueryUpdate>> {
        match self.stage {
            WatchStage::Initial => {
                let policy = self.options.fetch_policy;
                Some(self.first_update(policy).await)
            }
            WatchStage::CacheServed => {
                self.stage = WatchStage::Settled;
                Some(self.fetch_network().await)
            }
            WatchStage::Settled => None,
        }
    }

    /// Fetches again under the follow-up policy.
    ///
    /// `CacheAndNetwork` degenerates to a network fetch here, since a
    /// refetch resolves once.
    pub async fn refetch(&mut self) -> Result<QueryUpdate> {
        match self.options.next_fetch_policy {
            FetchPolicy::CacheFirst => match self.cached_update() {
                Some(update) => Ok(update),
                None => self.fetch_network().await,
            },
            FetchPolicy::CacheOnly => self.cached_update().ok_or(ClientError::CacheMiss),
            FetchPolicy::CacheAndNetwork | FetchPolicy::NetworkOnly => self.fetch_network().await,
        }
    }

    async fn first_update(&mut self, policy: FetchPolicy) -> Result<QueryUpdate> {
        match policy {
            FetchPolicy::CacheAndNetwork => match self.cached_update() {
                Some(update) => {
                    self.stage = WatchStage::CacheServed;
                    Ok(update)
                }
                None => {
                    self.stage = WatchStage::Settled;
                    self.fetch_network().await
                }
            },
            FetchPolicy::CacheFirst => {
                self.stage = WatchStage::Settled;
                match self.cached_update() {
                    Some(update) => Ok(update),
                    None => self.fetch_network().await,
                }
            }
            FetchPolicy::NetworkOnly => {
                self.stage = WatchStage::Settled;
                self.fetch_network().await
            }
            FetchPolicy::CacheOnly => {
                self.stage = WatchStage::Settled;
                self.cached_update().ok_or(ClientError::CacheMiss)
            }
        }
    }

    fn cached_update(&self) -> Option<QueryUpdate> {
        self.client.inner.cache.get(&self.operation).map(|data| QueryUpdate {
            source: UpdateSource::Cache,
            response: GraphQLResponse::from_data(data),
        })
    }

    async fn fetch_network(&self) -> Result<QueryUpdate> {
        let response = self.client.execute(self.operation.clone()).await?;
        if let Some(data) = response.raw_data() {
            self.client.inner.cache.store(&self.operation, data.clone());
        }
        Ok(QueryUpdate {
            source: UpdateSource::Network,
            response,
        })
    }
}

/// Derives a WebSocket URL from an HTTP URL by swapping the scheme.
fn http_to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
