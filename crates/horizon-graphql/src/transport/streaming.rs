//! Streaming WebSocket transport (graphql-transport-ws).
//!
//! Subscriptions share one lazily opened connection. The first subscription
//! spawns a connection task that owns the socket for its whole life:
//! handshake, `connection_init`, keep-alive pings, frame dispatch, and the
//! reconnect loop. Everything else talks to the task through a command
//! channel and a shared registry, so no socket state leaks out.
//!
//! A dropped connection is rebuilt after a fixed delay, indefinitely, with
//! the credential consulted fresh on every attempt. Once the new connection
//! is acknowledged every registered subscription is re-issued under its old
//! id. Ending the last subscription closes the connection; the next
//! subscription starts a new task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ClientError, Result};
use crate::link::CredentialProvider;
use crate::operation::Operation;
use crate::response::{GraphQLError, GraphQLResponse};

const TARGET: &str = "horizon_graphql::streaming";
const WS_SUBPROTOCOL: &str = "graphql-transport-ws";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Keep-alive probing for the streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How often a ping is sent.
    pub interval: Duration,
    /// How long after a ping a pong must arrive. Expiry terminates the
    /// connection and enters the reconnect path.
    pub pong_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for the streaming transport.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// WebSocket endpoint URL (ws:// or wss://).
    pub url: String,
    /// Timeout for the handshake of one connection attempt.
    pub connection_timeout: Duration,
    /// Fixed pause between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Keep-alive probing.
    pub keep_alive: KeepAliveConfig,
}

impl StreamingConfig {
    /// Creates a configuration with default timing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

/// Client/server frames of the graphql-transport-ws protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: Operation,
    },
    Next {
        id: String,
        payload: GraphQLResponse,
    },
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    Complete {
        id: String,
    },
}

/// A message delivered on a subscription stream.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// New data from the subscription.
    Data(GraphQLResponse),
    /// The server completed the subscription.
    Complete,
    /// The server rejected or aborted the subscription.
    Error(String),
}

#[derive(Debug)]
enum Command {
    Subscribe { id: String },
    Unsubscribe { id: String },
}

/// An active subscription's consumer side.
///
/// Dropping the stream (or calling [`stop`](Self::stop)) ends the
/// subscription on the server.
#[derive(Debug)]
pub struct SubscriptionStream {
    id: String,
    receiver: mpsc::Receiver<SubscriptionMessage>,
    command_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl SubscriptionStream {
    /// The protocol id of this subscription.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next message. Returns `None` once the subscription is
    /// finished and all buffered messages were consumed.
    pub async fn next(&mut self) -> Option<SubscriptionMessage> {
        self.receiver.recv().await
    }

    /// Ends the subscription early.
    pub fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Unsubscribe {
                id: self.id.clone(),
            });
        }
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RegisteredSubscription {
    operation: Operation,
    sender: mpsc::Sender<SubscriptionMessage>,
}

#[derive(Default)]
struct TransportState {
    subscriptions: HashMap<String, RegisteredSubscription>,
    // Present while a connection task is serving this transport. Cleared
    // by the task itself, under this lock, when it decides to exit; that
    // keeps last-unsubscribe and a racing new subscribe consistent.
    command_tx: Option<mpsc::UnboundedSender<Command>>,
}

/// WebSocket transport for subscription operations.
#[derive(Clone)]
pub struct StreamingTransport {
    inner: Arc<StreamingInner>,
}

struct StreamingInner {
    config: StreamingConfig,
    credentials: Arc<dyn CredentialProvider>,
    state: Mutex<TransportState>,
    next_id: AtomicU64,
}

impl StreamingTransport {
    /// Creates the transport. No connection is made until the first
    /// subscription.
    pub fn new(config: StreamingConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner: Arc::new(StreamingInner {
                config,
                credentials,
                state: Mutex::new(TransportState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The configuration in force.
    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Number of currently registered subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Starts a subscription, opening the shared connection if needed.
    pub async fn subscribe(&self, operation: Operation) -> Result<SubscriptionStream> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (sender, receiver) = mpsc::channel(32);

        let command_tx = {
            let mut state = self.inner.state.lock();
            state.subscriptions.insert(
                id.clone(),
                RegisteredSubscription { operation, sender },
            );
            match &state.command_tx {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.command_tx = Some(tx.clone());
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(connection_task(inner, rx));
                    tx
                }
            }
        };

        if command_tx
            .send(Command::Subscribe { id: id.clone() })
            .is_err()
        {
            self.inner.state.lock().subscriptions.remove(&id);
            return Err(ClientError::WebSocket(
                "subscription connection is shutting down".to_string(),
            ));
        }

        Ok(SubscriptionStream {
            id,
            receiver,
            command_tx: Some(command_tx),
        })
    }
}

/// Why one connection session ended.
enum SessionEnd {
    /// The socket dropped or went silent; reconnect.
    Dropped,
    /// The last subscription ended; the task is done.
    Shutdown,
}

/// Owns the connection for the life of the transport's subscriptions,
/// reconnecting dropped sessions after a fixed delay.
async fn connection_task(inner: Arc<StreamingInner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        {
            let mut state = inner.state.lock();
            if state.subscriptions.is_empty() {
                state.command_tx = None;
                break;
            }
        }

        // fresh credential on every attempt, so rotations apply to reconnects
        let token = inner.credentials.bearer_token().await;
        let init_payload =
            token.map(|token| serde_json::json!({ "Authorization": format!("Bearer {token}") }));

        match connect(&inner.config).await {
            Ok(ws) => {
                tracing::info!(target: TARGET, url = %inner.config.url, "subscription connection established");
                match run_connection(&inner, ws, init_payload, &mut commands).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Dropped => {}
                }
            }
            Err(error) => {
                tracing::warn!(target: TARGET, error = %error, "subscription connect failed");
            }
        }

        // apply unsubscribes that arrived while the socket was down; queued
        // subscribes are covered by the registry replay on the next ack
        while let Ok(command) = commands.try_recv() {
            if let Command::Unsubscribe { id } = command {
                inner.state.lock().subscriptions.remove(&id);
            }
        }

        {
            let mut state = inner.state.lock();
            if state.subscriptions.is_empty() {
                state.command_tx = None;
                break;
            }
        }

        tracing::debug!(
            target: TARGET,
            delay_ms = inner.config.reconnect_delay.as_millis() as u64,
            "reconnecting subscription connection"
        );
        tokio::time::sleep(inner.config.reconnect_delay).await;
    }
}

fn build_request(config: &StreamingConfig) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        http::HeaderValue::from_static(WS_SUBPROTOCOL),
    );
    Ok(request)
}

async fn connect(config: &StreamingConfig) -> Result<WsStream> {
    let request = build_request(config)?;
    let (stream, _response) =
        tokio::time::timeout(config.connection_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
    Ok(stream)
}

/// Runs one connection session until it drops or the task should exit.
async fn run_connection(
    inner: &Arc<StreamingInner>,
    ws: WsStream,
    init_payload: Option<Value>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    if send_frame(&mut write, &WireMessage::ConnectionInit {
        payload: init_payload,
    })
    .await
    .is_err()
    {
        return SessionEnd::Dropped;
    }

    let keep_alive = inner.config.keep_alive.clone();
    let mut acked = false;
    // ids whose subscribe frame already went out on this socket; a command
    // that raced the ack replay must not issue its id a second time, the
    // server would answer the duplicate by closing with 4409
    let mut issued: HashSet<String> = HashSet::new();
    let mut ping_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + keep_alive.interval,
        keep_alive.interval,
    );
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // armed by an unanswered ping, cleared only by an explicit pong
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Subscribe { id }) => {
                    // before the ack the registry replay covers it
                    if acked && !issued.contains(&id) {
                        let operation = {
                            let state = inner.state.lock();
                            state.subscriptions.get(&id).map(|s| s.operation.clone())
                        };
                        if let Some(payload) = operation {
                            issued.insert(id.clone());
                            if send_frame(&mut write, &WireMessage::Subscribe { id, payload })
                                .await
                                .is_err()
                            {
                                return SessionEnd::Dropped;
                            }
                        }
                    }
                }
                Some(Command::Unsubscribe { id }) => {
                    let (known, empty_now) = {
                        let mut state = inner.state.lock();
                        let known = state.subscriptions.remove(&id).is_some();
                        let empty_now = state.subscriptions.is_empty();
                        if empty_now {
                            state.command_tx = None;
                        }
                        (known, empty_now)
                    };
                    issued.remove(&id);
                    if known {
                        let _ = send_frame(&mut write, &WireMessage::Complete { id }).await;
                    }
                    if empty_now {
                        tracing::debug!(target: TARGET, "last subscription ended, closing connection");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                }
                None => return SessionEnd::Shutdown,
            },

            _ = ping_interval.tick() => {
                if send_frame(&mut write, &WireMessage::Ping { payload: None }).await.is_err() {
                    return SessionEnd::Dropped;
                }
                // the earliest outstanding ping keeps its deadline
                if pong_deadline.is_none() {
                    pong_deadline = Some(tokio::time::Instant::now() + keep_alive.pong_timeout);
                }
            }

            _ = wait_until(pong_deadline) => {
                tracing::warn!(
                    target: TARGET,
                    timeout_ms = keep_alive.pong_timeout.as_millis() as u64,
                    "no pong within the keep-alive window, terminating connection"
                );
                return SessionEnd::Dropped;
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WireMessage>(&text) {
                        Ok(message) => {
                            if let Some(end) = handle_message(
                                inner,
                                &mut write,
                                &mut acked,
                                &mut issued,
                                &mut pong_deadline,
                                message,
                            )
                            .await
                            {
                                return end;
                            }
                        }
                        Err(error) => {
                            tracing::debug!(target: TARGET, error = %error, "ignoring unrecognized frame");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    match &frame {
                        Some(frame) => tracing::warn!(
                            target: TARGET,
                            code = u16::from(frame.code),
                            reason = %frame.reason,
                            "server closed subscription connection"
                        ),
                        None => tracing::warn!(
                            target: TARGET,
                            "server closed subscription connection"
                        ),
                    }
                    return SessionEnd::Dropped;
                }
                // ws-level ping/pong and binary frames need no handling here
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::warn!(target: TARGET, error = %error, "subscription connection failed");
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            },
        }
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn handle_message(
    inner: &Arc<StreamingInner>,
    write: &mut WsSink,
    acked: &mut bool,
    issued: &mut HashSet<String>,
    pong_deadline: &mut Option<tokio::time::Instant>,
    message: WireMessage,
) -> Option<SessionEnd> {
    match message {
        WireMessage::ConnectionAck { .. } => {
            *acked = true;
            let pending: Vec<(String, Operation)> = {
                let state = inner.state.lock();
                state
                    .subscriptions
                    .iter()
                    .map(|(id, sub)| (id.clone(), sub.operation.clone()))
                    .collect()
            };
            tracing::debug!(
                target: TARGET,
                subscriptions = pending.len(),
                "connection acknowledged"
            );
            for (id, payload) in pending {
                // a repeated ack replays nothing already on the wire
                if !issued.insert(id.clone()) {
                    continue;
                }
                if send_frame(write, &WireMessage::Subscribe { id, payload })
                    .await
                    .is_err()
                {
                    return Some(SessionEnd::Dropped);
                }
            }
            None
        }
        WireMessage::Ping { .. } => {
            // server-initiated pings get an immediate pong
            let _ = send_frame(write, &WireMessage::Pong { payload: None }).await;
            None
        }
        WireMessage::Pong { .. } => {
            *pong_deadline = None;
            None
        }
        WireMessage::Next { id, payload } => {
            let state = inner.state.lock();
            if let Some(sub) = state.subscriptions.get(&id) {
                let _ = sub.sender.try_send(SubscriptionMessage::Data(payload));
            }
            None
        }
        WireMessage::Error { id, payload } => {
            let message = payload
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(target: TARGET, id = %id, error = %message, "subscription failed");
            issued.remove(&id);
            finish_subscription(inner, write, &id, SubscriptionMessage::Error(message)).await
        }
        WireMessage::Complete { id } => {
            issued.remove(&id);
            finish_subscription(inner, write, &id, SubscriptionMessage::Complete).await
        }
        // client-to-server frames are never expected inbound
        WireMessage::ConnectionInit { .. } | WireMessage::Subscribe { .. } => None,
    }
}

/// Delivers a terminal message and removes the subscription. Ends the
/// session when it was the last one.
async fn finish_subscription(
    inner: &Arc<StreamingInner>,
    write: &mut WsSink,
    id: &str,
    message: SubscriptionMessage,
) -> Option<SessionEnd> {
    let empty_now = {
        let mut state = inner.state.lock();
        if let Some(sub) = state.subscriptions.remove(id) {
            let _ = sub.sender.try_send(message);
        }
        let empty_now = state.subscriptions.is_empty();
        if empty_now {
            state.command_tx = None;
        }
        empty_now
    };
    if empty_now {
        tracing::debug!(target: TARGET, "last subscription ended, closing connection");
        let _ = write.send(Message::Close(None)).await;
        Some(SessionEnd::Shutdown)
    } else {
        None
    }
}

async fn send_frame(write: &mut WsSink, message: &WireMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::WebSocket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::StaticToken;
    use serde_json::json;

    #[test]
    fn test_subscribe_frame_shape() {
        let operation = Operation::subscription("subscription { tick }").variable("n", 1);
        let frame = WireMessage::Subscribe {
            id: "1".to_string(),
            payload: operation,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["id"], "1");
        assert_eq!(json["payload"]["query"], "subscription { tick }");
        assert_eq!(json["payload"]["variables"]["n"], 1);
        // context never crosses the wire
        assert!(json["payload"].get("context").is_none());
    }

    #[test]
    fn test_protocol_tag_names() {
        let init = serde_json::to_value(&WireMessage::ConnectionInit { payload: None }).unwrap();
        assert_eq!(init, json!({"type": "connection_init"}));

        let ping = serde_json::to_value(&WireMessage::Ping { payload: None }).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));

        let complete = serde_json::to_value(&WireMessage::Complete {
            id: "7".to_string(),
        })
        .unwrap();
        assert_eq!(complete, json!({"type": "complete", "id": "7"}));
    }

    #[test]
    fn test_parse_server_frames() {
        let ack: WireMessage = serde_json::from_str(r#"{"type": "connection_ack"}"#).unwrap();
        assert!(matches!(ack, WireMessage::ConnectionAck { payload: None }));

        let next: WireMessage = serde_json::from_str(
            r#"{"type": "next", "id": "1", "payload": {"data": {"tick": 3}}}"#,
        )
        .unwrap();
        let WireMessage::Next { id, payload } = next else {
            panic!("expected next frame");
        };
        assert_eq!(id, "1");
        assert_eq!(payload.raw_data().unwrap()["tick"], 3);

        let error: WireMessage = serde_json::from_str(
            r#"{"type": "error", "id": "1", "payload": [{"message": "denied"}]}"#,
        )
        .unwrap();
        let WireMessage::Error { payload, .. } = error else {
            panic!("expected error frame");
        };
        assert_eq!(payload[0].message, "denied");
    }

    #[test]
    fn test_keep_alive_defaults() {
        let keep_alive = KeepAliveConfig::default();
        assert_eq!(keep_alive.interval, Duration::from_secs(30));
        assert_eq!(keep_alive.pong_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_streaming_config_defaults() {
        let config = StreamingConfig::new("ws://localhost:4000/graphql");
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));

        // construction is lazy; the configuration is readable before any
        // subscription opens the connection
        let transport = StreamingTransport::new(config, Arc::new(StaticToken::anonymous()));
        assert_eq!(transport.config().url, "ws://localhost:4000/graphql");
        assert_eq!(transport.active_subscriptions(), 0);
    }
}
