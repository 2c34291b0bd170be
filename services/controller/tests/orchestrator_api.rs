//! Orchestrator client and event feed against a mock HTTP server.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use vlb_controller::feed::{run_event_feed, FeedConfig};
use vlb_controller::orchestrator::{EndpointResolver, EventSeverity, OrchestratorClient, StatusSink};
use vlb_controller::service::{ServiceEvent, FINALIZER};
use vlb_id::ServiceKey;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICE: &str = "/v1/namespaces/shop/services/web";

fn web() -> ServiceKey {
    ServiceKey::new("shop", "web").unwrap()
}

fn client(server: &MockServer) -> OrchestratorClient {
    OrchestratorClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_resolve_returns_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICE}/endpoints")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"addresses": ["10.0.0.1", "10.0.0.2"]})),
        )
        .mount(&server)
        .await;

    let addresses = client(&server).resolve(&web()).await.unwrap();
    assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
}

#[tokio::test]
async fn test_resolve_unknown_service_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICE}/endpoints")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).resolve(&web()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICE}/endpoints")))
        .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
        .mount(&server)
        .await;

    let err = client(&server).resolve(&web()).await.unwrap_err();
    assert!(err.to_string().contains("503"));
    assert!(err.to_string().contains("draining"));
}

#[tokio::test]
async fn test_set_assigned_address_puts_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("{SERVICE}/status")))
        .and(body_json(json!({"assignedAddress": "10.1.1.55"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .set_assigned_address(&web(), Ipv4Addr::new(10, 1, 1, 55))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_clearing_missing_state_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    client.clear_assigned_address(&web()).await.unwrap();
    client.remove_finalizer(&web(), FINALIZER).await.unwrap();
}

#[tokio::test]
async fn test_add_finalizer_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{SERVICE}/finalizers")))
        .and(body_json(json!({"finalizer": FINALIZER})))
        .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
        .mount(&server)
        .await;

    let err = client(&server).add_finalizer(&web(), FINALIZER).await.unwrap_err();
    assert!(err.to_string().contains("add finalizer"));
}

#[tokio::test]
async fn test_record_event_posts_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{SERVICE}/events")))
        .and(body_partial_json(json!({
            "severity": "Warning",
            "reason": "NoCapacity",
            "message": "pool exhausted",
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .record_event(&web(), EventSeverity::Warning, "NoCapacity", "pool exhausted")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_feed_forwards_events_and_persists_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/services/events"))
        .and(query_param("after_event_id", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "event_id": 10,
                    "event_type": "service.upserted",
                    "payload": {"key": "shop/web", "kind": "LoadBalancer", "ports": [{"port": 80}]}
                },
                {"event_id": 11, "event_type": "node.joined", "payload": {}},
                {"event_id": 12, "event_type": "service.deleted", "payload": {"namespace": "shop", "name": "old"}}
            ],
            "next_after_event_id": 12
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/services/events"))
        .and(query_param("after_event_id", "12"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"items": [], "next_after_event_id": 12})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cursor_file = dir.path().join("cursor");
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed = tokio::spawn(run_event_feed(
        FeedConfig {
            poll_interval: Duration::from_millis(20),
            fetch_limit: 50,
            cursor_file: Some(cursor_file.clone()),
        },
        Arc::new(client(&server)),
        events_tx,
        shutdown_rx,
    ));

    match events_rx.recv().await.unwrap() {
        ServiceEvent::Upserted(spec) => assert_eq!(spec.key, web()),
        other => panic!("unexpected event {other:?}"),
    }
    match events_rx.recv().await.unwrap() {
        ServiceEvent::Deleted(key) => assert_eq!(key, ServiceKey::new("shop", "old").unwrap()),
        other => panic!("unexpected event {other:?}"),
    }

    shutdown_tx.send(true).unwrap();
    feed.await.unwrap().unwrap();

    assert_eq!(std::fs::read_to_string(&cursor_file).unwrap(), "12");
}
