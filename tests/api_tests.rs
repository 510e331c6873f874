//--------------------------------------------------------------------------------------------------
// TEST MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module contains integration tests for the payment API.
// Routes run against an in-memory store and an in-memory broker.
//--------------------------------------------------------------------------------------------------

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use rabbitmq::{BrokerEndpoint, ConnectionManager, ReconnectPolicy, memory::MemoryBroker};
use serde_json::{Value, from_slice, json};
use tower::ServiceExt;

use payment_service::{
    InMemoryPaymentRepository, RabbitEventSink,
    api::{Api, AppState},
    topology::{PAYMENT_REFUND, PAYMENT_REQUEST, payment_topology},
};

/// Sets up a test router backed by a fresh broker.
fn setup_test_router() -> (Router, MemoryBroker, ConnectionManager) {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::builder(BrokerEndpoint::default(), payment_topology().unwrap())
        .transport(broker.clone())
        .reconnect_policy(ReconnectPolicy::new(5, Duration::from_secs(5)))
        .liveness_interval(Duration::from_secs(3600))
        .build();
    let state = AppState::new(
        Arc::new(InMemoryPaymentRepository::new()),
        Arc::new(RabbitEventSink::new(manager.clone(), "payment-service-test")),
        manager.clone(),
    );
    let api = Api::new(SocketAddr::from(([127, 0, 0, 1], 0)), state);
    (api.routes(), broker, manager)
}

/// Helper to parse JSON responses
async fn parse_json_response(response: Response) -> Value {
    let body_bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    from_slice(&body_bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn create_payment(app: &Router, user_id: &str, order_id: &str, amount: f64) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/payments",
            json!({ "userId": user_id, "orderId": order_id, "amount": amount }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    parse_json_response(response).await
}

#[tokio::test]
async fn test_root_endpoint() {
    let (app, _, _) = setup_test_router();

    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"Payment service is running");
}

#[tokio::test]
async fn test_create_payment_publishes_a_payment_request() {
    let (app, broker, _) = setup_test_router();

    let body = create_payment(&app, "user-1", "order-1", 42.5).await;

    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["userId"], "user-1");
    assert_eq!(body["data"]["orderId"], "order-1");
    assert_eq!(body["data"]["amount"], 42.5);
    assert!(body["data"]["id"].is_string());

    let queued = broker.queued_bodies(PAYMENT_REQUEST);
    assert_eq!(queued.len(), 1);
    let request: Value = from_slice(&queued[0]).unwrap();
    assert_eq!(
        request,
        json!({ "orderId": "order-1", "amount": 42.5, "userId": "user-1" })
    );
}

#[tokio::test]
async fn test_create_payment_rejects_duplicate_user() {
    let (app, broker, _) = setup_test_router();
    create_payment(&app, "user-1", "order-1", 10.0).await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/payments",
            json!({ "userId": "user-1", "orderId": "order-2", "amount": 5 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_json_response(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], 400);
    assert_eq!(broker.queue_depth(PAYMENT_REQUEST), 1);
}

#[tokio::test]
async fn test_create_payment_validates_input() {
    let (app, broker, _) = setup_test_router();

    let non_positive = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/payments",
            json!({ "userId": "user-1", "orderId": "order-1", "amount": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(non_positive.status(), StatusCode::BAD_REQUEST);

    let missing_order = app
        .oneshot(json_request(
            "POST",
            "/api/payments",
            json!({ "userId": "user-1", "amount": 3 }),
        ))
        .await
        .unwrap();
    assert_eq!(missing_order.status(), StatusCode::BAD_REQUEST);

    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_create_payment_reports_unreachable_broker() {
    let (app, broker, manager) = setup_test_router();
    broker.set_refuse_connections(true);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/payments",
            json!({ "userId": "user-1", "orderId": "order-1", "amount": 3 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!manager.status().is_connected());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_list_and_get_payments() {
    let (app, _, _) = setup_test_router();
    let first = create_payment(&app, "user-1", "order-1", 10.0).await;
    create_payment(&app, "user-2", "order-2", 20.0).await;

    let response = app
        .clone()
        .oneshot(Request::get("/api/payments").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = parse_json_response(response).await;
    assert_eq!(list["count"], 2);
    assert_eq!(list["data"][0]["userId"], "user-1");
    assert_eq!(list["data"][1]["userId"], "user-2");

    let id = first["data"]["id"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/payments/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(parse_json_response(response).await["data"], first["data"]);

    let response = app
        .oneshot(
            Request::get(format!("/api/payments/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(parse_json_response(response).await["error"]["code"], 404);
}

#[tokio::test]
async fn test_update_payment() {
    let (app, _, _) = setup_test_router();
    let created = create_payment(&app, "user-1", "order-1", 10.0).await;
    let id = created["data"]["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/api/payments/{}", id),
            json!({ "amount": 12.75 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_response(response).await;
    assert_eq!(body["data"]["amount"], 12.75);
    assert_eq!(body["data"]["orderId"], "order-1");
    assert_eq!(body["data"]["createdAt"], created["data"]["createdAt"]);

    let response = app
        .oneshot(json_request(
            "PUT",
            &format!("/api/payments/{}", uuid::Uuid::new_v4()),
            json!({ "amount": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refund_payment_publishes_a_refund_request() {
    let (app, broker, _) = setup_test_router();
    let created = create_payment(&app, "user-1", "order-1", 10.0).await;
    let id = created["data"]["id"].as_str().unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/api/payments/{}/refund", id),
            json!({ "reason": "damaged" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let queued = broker.queued_bodies(PAYMENT_REFUND);
    assert_eq!(queued.len(), 1);
    let request: Value = from_slice(&queued[0]).unwrap();
    assert_eq!(
        request,
        json!({ "orderId": "order-1", "amount": 10.0, "reason": "damaged" })
    );
}

#[tokio::test]
async fn test_broker_status_endpoint() {
    let (app, _, manager) = setup_test_router();

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/payments/test/rabbitmq")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_json_response(response).await;
    assert_eq!(body["status"]["isConnected"], false);
    assert_eq!(body["status"]["isConnecting"], false);
    assert_eq!(body["status"]["reconnectAttempts"], 0);
    assert_eq!(body["status"]["queues"].as_array().unwrap().len(), 6);

    manager.connect().await.unwrap();
    let response = app
        .oneshot(
            Request::get("/api/payments/test/rabbitmq")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = parse_json_response(response).await;
    assert_eq!(body["status"]["isConnected"], true);
    assert_eq!(body["status"]["queues"][0], PAYMENT_REQUEST);
}

#[tokio::test]
async fn test_malformed_payment_id_is_a_json_bad_request() {
    let (app, broker, _) = setup_test_router();

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/payments/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_json_response(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], 400);
    assert!(body["error"]["message"].is_string());

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/payments/not-a-uuid/refund",
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(parse_json_response(response).await["success"], false);
    assert!(broker.published().is_empty());
}
