//! Wire-level routing behavior: which transport an operation leaves on.

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use horizon_graphql::transport::{Route, RoutingTable, TransportKind};
use horizon_graphql::{Client, Operation, OperationType};

/// Answers single-object bodies with one response and array bodies with a
/// matching response array, so both HTTP transports are satisfied.
struct ShapeAware;

impl Respond for ShapeAware {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("json body");
        if let Some(operations) = body.as_array() {
            let responses: Vec<Value> =
                operations.iter().map(|_| json!({"data": {"ok": true}})).collect();
            ResponseTemplate::new(200).set_body_json(responses)
        } else {
            ResponseTemplate::new(200).set_body_json(json!({"data": {"ok": true}}))
        }
    }
}

async fn shape_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ShapeAware)
        .mount(&server)
        .await;
    server
}

fn client(server: &MockServer) -> Client {
    Client::builder(format!("{}/graphql", server.uri()))
        .build()
        .expect("build client")
}

async fn body_shapes(server: &MockServer) -> Vec<bool> {
    server
        .received_requests()
        .await
        .expect("recording")
        .iter()
        .map(|request| {
            serde_json::from_slice::<Value>(&request.body)
                .expect("json body")
                .is_array()
        })
        .collect()
}

#[tokio::test]
async fn test_queries_go_out_as_single_requests() {
    let server = shape_server().await;
    let client = client(&server);

    client
        .execute(Operation::query("{ users }"))
        .await
        .expect("query");

    assert_eq!(body_shapes(&server).await, vec![false]);
}

#[tokio::test]
async fn test_batch_hinted_query_still_goes_single() {
    let server = shape_server().await;
    let client = client(&server);

    client
        .execute(Operation::query("{ users }").batched())
        .await
        .expect("query");

    assert_eq!(body_shapes(&server).await, vec![false]);
}

#[tokio::test]
async fn test_unhinted_mutation_goes_single() {
    let server = shape_server().await;
    let client = client(&server);

    client
        .execute(Operation::mutation("mutation { bump }"))
        .await
        .expect("mutation");

    assert_eq!(body_shapes(&server).await, vec![false]);
}

#[tokio::test]
async fn test_batch_hinted_mutation_goes_to_the_batch_transport() {
    let server = shape_server().await;
    let client = client(&server);

    client
        .execute(Operation::mutation("mutation { bump }").batched())
        .await
        .expect("mutation");

    assert_eq!(body_shapes(&server).await, vec![true]);
}

#[tokio::test]
async fn test_custom_routing_table_overrides_the_standard_rules() {
    let server = shape_server().await;

    // route every mutation through the batch transport, hinted or not
    let table = RoutingTable::new(
        vec![
            Route {
                name: "subscriptions",
                matches: |op| op.operation_type() == OperationType::Subscription,
                destination: TransportKind::Streaming,
            },
            Route {
                name: "all-mutations",
                matches: |op| op.operation_type() == OperationType::Mutation,
                destination: TransportKind::Batched,
            },
        ],
        TransportKind::Single,
    );

    let client = Client::builder(format!("{}/graphql", server.uri()))
        .routing_table(table)
        .build()
        .expect("build client");

    client
        .execute(Operation::mutation("mutation { bump }"))
        .await
        .expect("mutation");

    assert_eq!(body_shapes(&server).await, vec![true]);
}
