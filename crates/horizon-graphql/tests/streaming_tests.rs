//! Streaming transport tests against a local graphql-transport-ws server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use horizon_graphql::transport::StreamingTransport;
use horizon_graphql::{
    KeepAliveConfig, Operation, SharedToken, StaticToken, StreamingConfig, SubscriptionMessage,
};

/// What the test server does with client frames.
#[derive(Debug, Clone, Default)]
struct ServerBehavior {
    answer_pings: bool,
    next_on_subscribe: bool,
    complete_on_subscribe: bool,
    error_on_subscribe: bool,
    /// Pause between `connection_init` and the ack.
    ack_delay_ms: u64,
    /// Acknowledge every `connection_init` twice.
    double_ack: bool,
}

/// Everything the test server observed.
#[derive(Debug, Default)]
struct ServerLog {
    connections: AtomicUsize,
    init_payloads: Mutex<Vec<Value>>,
    /// (connection number, subscription id) per subscribe frame.
    subscribes: Mutex<Vec<(usize, String)>>,
}

async fn spawn_server(behavior: ServerBehavior) -> (String, Arc<ServerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let log = Arc::new(ServerLog::default());

    let accept_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            let log = Arc::clone(&accept_log);
            tokio::spawn(async move {
                // the client requests the graphql-transport-ws subprotocol and
                // fails any handshake whose 101 response does not echo it
                let negotiate = |_request: &Request, mut response: Response| {
                    response.headers_mut().insert(
                        "Sec-WebSocket-Protocol",
                        http::HeaderValue::from_static("graphql-transport-ws"),
                    );
                    Ok(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, negotiate).await else {
                    return;
                };
                serve_connection(ws, behavior, log).await;
            });
        }
    });

    (format!("ws://{addr}/graphql"), log)
}

async fn serve_connection(
    ws: WebSocketStream<TcpStream>,
    behavior: ServerBehavior,
    log: Arc<ServerLog>,
) {
    let connection = log.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut write, mut read) = ws.split();

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match frame["type"].as_str() {
            Some("connection_init") => {
                log.init_payloads.lock().push(frame["payload"].clone());
                if behavior.ack_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(behavior.ack_delay_ms)).await;
                }
                let ack = json!({"type": "connection_ack"});
                let _ = write.send(Message::Text(ack.to_string().into())).await;
                if behavior.double_ack {
                    let ack = json!({"type": "connection_ack"});
                    let _ = write.send(Message::Text(ack.to_string().into())).await;
                }
            }
            Some("ping") => {
                if behavior.answer_pings {
                    let pong = json!({"type": "pong"});
                    let _ = write.send(Message::Text(pong.to_string().into())).await;
                }
            }
            Some("subscribe") => {
                let id = frame["id"].as_str().unwrap_or_default().to_string();
                log.subscribes.lock().push((connection, id.clone()));
                if behavior.next_on_subscribe {
                    let next = json!({
                        "type": "next",
                        "id": id,
                        "payload": {"data": {"tick": connection}}
                    });
                    let _ = write.send(Message::Text(next.to_string().into())).await;
                }
                if behavior.error_on_subscribe {
                    let error = json!({
                        "type": "error",
                        "id": id,
                        "payload": [{"message": "denied"}]
                    });
                    let _ = write.send(Message::Text(error.to_string().into())).await;
                } else if behavior.complete_on_subscribe {
                    let complete = json!({"type": "complete", "id": id});
                    let _ = write.send(Message::Text(complete.to_string().into())).await;
                }
            }
            _ => {}
        }
    }
}

fn quick_config(url: &str) -> StreamingConfig {
    StreamingConfig {
        url: url.to_string(),
        connection_timeout: Duration::from_secs(5),
        reconnect_delay: Duration::from_millis(50),
        keep_alive: KeepAliveConfig {
            interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(100),
        },
    }
}

/// Polls a condition until it holds or the deadline passes.
async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_subscription_receives_data() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        next_on_subscribe: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    let message = stream.next().await.expect("first message");
    let SubscriptionMessage::Data(response) = message else {
        panic!("expected data, got {message:?}");
    };
    assert_eq!(response.raw_data().unwrap()["tick"], 1);

    // anonymous sessions send no payload with connection_init
    assert!(log.init_payloads.lock()[0].is_null());
}

#[tokio::test]
async fn test_credential_in_connection_init() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        next_on_subscribe: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::new("secret-token")));
    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");
    stream.next().await.expect("first message");

    let payloads = log.init_payloads.lock();
    assert_eq!(payloads[0]["Authorization"], "Bearer secret-token");
}

#[tokio::test]
async fn test_missed_pong_terminates_and_resubscribes() {
    // the server acknowledges but never answers pings
    let (url, log) = spawn_server(ServerBehavior::default()).await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let _stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    let reconnected = wait_for(Duration::from_secs(5), || {
        log.connections.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(reconnected, "expected a reconnect after the missed pong");

    let resubscribed = wait_for(Duration::from_secs(5), || {
        let subscribes = log.subscribes.lock();
        subscribes.iter().any(|(connection, _)| *connection == 1)
            && subscribes.iter().any(|(connection, _)| *connection >= 2)
    })
    .await;
    assert!(resubscribed, "expected the subscription to be re-issued");

    // same protocol id across sessions
    let subscribes = log.subscribes.lock();
    let first_id = &subscribes[0].1;
    assert!(subscribes.iter().all(|(_, id)| id == first_id));
}

#[tokio::test]
async fn test_answered_pings_keep_the_connection() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let _stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    // several full ping cycles
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(log.connections.load(Ordering::SeqCst), 1);
    assert_eq!(transport.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_credential_consulted_fresh_on_reconnect() {
    // unanswered pings force a reconnect cycle
    let (url, log) = spawn_server(ServerBehavior::default()).await;

    let token = SharedToken::new();
    token.set("first");
    let transport = StreamingTransport::new(quick_config(&url), Arc::new(token.clone()));
    let _stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    assert!(
        wait_for(Duration::from_secs(5), || !log.init_payloads.lock().is_empty()).await,
        "expected a first connection"
    );
    token.set("second");

    assert!(
        wait_for(Duration::from_secs(5), || log.init_payloads.lock().len() >= 2).await,
        "expected a reconnect"
    );

    let payloads = log.init_payloads.lock();
    assert_eq!(payloads[0]["Authorization"], "Bearer first");
    assert_eq!(
        payloads.last().unwrap()["Authorization"],
        "Bearer second"
    );
}

#[tokio::test]
async fn test_last_drop_closes_then_new_subscribe_reconnects() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        next_on_subscribe: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));

    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");
    stream.next().await.expect("first message");
    drop(stream);

    assert!(
        wait_for(Duration::from_secs(5), || transport.active_subscriptions() == 0).await,
        "expected the registry to empty after the drop"
    );

    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("resubscribe");
    let message = stream.next().await.expect("message on new connection");
    let SubscriptionMessage::Data(response) = message else {
        panic!("expected data, got {message:?}");
    };
    // served by a second connection
    assert_eq!(response.raw_data().unwrap()["tick"], 2);
    assert_eq!(log.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_repeated_ack_does_not_reissue_subscriptions() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        double_ack: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let _stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    assert!(
        wait_for(Duration::from_secs(5), || !log.subscribes.lock().is_empty()).await,
        "expected the subscription to reach the wire"
    );
    // leave room for the second ack to (wrongly) trigger another replay
    tokio::time::sleep(Duration::from_millis(100)).await;

    let subscribes = log.subscribes.lock();
    assert_eq!(subscribes.len(), 1, "the second ack reissued the subscription");
}

#[tokio::test]
async fn test_subscribe_during_connection_setup_is_issued_once() {
    let (url, log) = spawn_server(ServerBehavior {
        answer_pings: true,
        ack_delay_ms: 100,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let first = transport
        .subscribe(Operation::subscription("subscription { alpha }"))
        .await
        .expect("first subscribe");
    // lands while the connection is still waiting for its ack, so its
    // command and the ack replay race for the same id
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = transport
        .subscribe(Operation::subscription("subscription { beta }"))
        .await
        .expect("second subscribe");

    assert!(
        wait_for(Duration::from_secs(5), || log.subscribes.lock().len() >= 2).await,
        "expected both subscriptions to reach the wire"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let subscribes = log.subscribes.lock();
    assert_eq!(subscribes.len(), 2);
    let mut ids: Vec<&str> = subscribes.iter().map(|(_, id)| id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 2, "a subscription id went out more than once");
    assert!(ids.contains(&first.id()));
    assert!(ids.contains(&second.id()));
}

#[tokio::test]
async fn test_server_complete_finishes_stream() {
    let (url, _log) = spawn_server(ServerBehavior {
        answer_pings: true,
        next_on_subscribe: true,
        complete_on_subscribe: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    assert!(matches!(
        stream.next().await,
        Some(SubscriptionMessage::Data(_))
    ));
    assert!(matches!(
        stream.next().await,
        Some(SubscriptionMessage::Complete)
    ));
    assert!(stream.next().await.is_none());
    assert_eq!(transport.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_server_error_fails_stream() {
    let (url, _log) = spawn_server(ServerBehavior {
        answer_pings: true,
        error_on_subscribe: true,
        ..Default::default()
    })
    .await;

    let transport =
        StreamingTransport::new(quick_config(&url), Arc::new(StaticToken::anonymous()));
    let mut stream = transport
        .subscribe(Operation::subscription("subscription { tick }"))
        .await
        .expect("subscribe");

    let message = stream.next().await.expect("error message");
    let SubscriptionMessage::Error(reason) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(reason, "denied");
    assert!(stream.next().await.is_none());
}
