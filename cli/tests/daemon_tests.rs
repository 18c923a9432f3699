// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The assembled daemon: merged routes in-process, and a real listener driven
//! by the SDK over HTTP.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use bazaar::commands::config::CONFIG_TEMPLATE;
use bazaar::daemon::Daemon;
use bazaar_core::application::registry::RegistryApi;
use bazaar_core::domain::agent::{AgentId, DiscoveryQuery, PublishRequest};
use bazaar_core::domain::engine::{WorkItemId, WorkItemRecord};
use bazaar_core::domain::error::MarketplaceError;
use bazaar_core::domain::handoff::HandoffRequest;
use bazaar_core::domain::node_config::MarketplaceConfigManifest;
use bazaar_core::infrastructure::engine::InMemoryWorkflowEngine;
use bazaar_sdk::{Agent, AgentConfig, AgentState, ChannelHandoffDelivery, MarketplaceClient, WorkHandler, WorkOutcome};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn config() -> MarketplaceConfigManifest {
    let mut config = MarketplaceConfigManifest::from_yaml_str(CONFIG_TEMPLATE).unwrap();
    config.spec.handoff.signing_secret = Some("daemon-test-secret-daemon-test-secret".to_string());
    config
}

async fn call(app: &axum::Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_daemon_serves_registry_and_conflict_routes() {
    let daemon = Daemon::build(&config()).unwrap();
    let app = daemon.router();

    let (status, _) = call(
        &app,
        Method::POST,
        "/agents",
        Some(json!({ "agentId": "a1", "capabilities": ["invoice"], "endpoint": "http://a1:9000" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, page) = call(&app, Method::GET, "/agents?capability=invoice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);

    let (status, body) = call(&app, Method::POST, "/conflicts/wi-1", Some(json!({ "quorum": 2 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "COLLECTING");

    let (status, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["liveAgents"], 1);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_daemon_rejects_capabilities_outside_schema() {
    let daemon = Daemon::build(&config()).unwrap();
    let (status, body) = call(
        &daemon.router(),
        Method::POST,
        "/agents",
        Some(json!({ "agentId": "a1", "capabilities": ["teleport"], "endpoint": "http://a1:9000" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["class"], "fatal");
    daemon.shutdown().await;
}

struct Stamp;

#[async_trait]
impl WorkHandler for Stamp {
    async fn handle(&self, item: &WorkItemRecord) -> WorkOutcome {
        WorkOutcome::Completed(json!({ "done": item.work_item_id }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sdk_over_http_against_live_daemon() {
    let daemon = Daemon::build(&config()).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = daemon.router();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let client = Arc::new(MarketplaceClient::new(format!("http://{}", addr)).unwrap());

    // Raw client round trip
    let lease = client
        .publish(PublishRequest::new("probe", ["shipping"], "http://probe:9000"))
        .await
        .unwrap();
    client.renew(&AgentId::new("probe"), lease).await.unwrap();
    let err = client
        .publish(PublishRequest::new("probe", ["shipping"], "http://probe:9000"))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::DuplicateAgentId(_)));

    client
        .publish(PublishRequest::new("courier", ["shipping"], "http://courier:9000"))
        .await
        .unwrap();
    let grant = client
        .request_handoff(HandoffRequest {
            work_item_id: WorkItemId::new("wi-parcel"),
            source_agent_id: AgentId::new("probe"),
            target_agent_id: AgentId::new("courier"),
            capability: None,
        })
        .await
        .unwrap();
    let ack = client
        .acknowledge_handoff(&grant.token, Some(&AgentId::new("courier")))
        .await
        .unwrap();
    assert_eq!(ack.work_item_id, WorkItemId::new("wi-parcel"));
    let replay = client
        .acknowledge_handoff(&grant.token, Some(&AgentId::new("courier")))
        .await
        .unwrap_err();
    assert!(matches!(replay, MarketplaceError::TokenInvalid(_)));

    // A full agent lifecycle over HTTP
    let engine = Arc::new(InMemoryWorkflowEngine::new(Duration::from_secs(60)));
    engine.enable(WorkItemRecord::enabled("wi-http", "invoice"));
    let handle = Agent::new(
        AgentConfig::new("worker", ["invoice"], "http://worker:9000"),
        client.clone(),
        engine.clone(),
        Arc::new(Stamp),
        Arc::new(ChannelHandoffDelivery::new()),
    )
    .spawn();
    assert!(handle.wait_for(AgentState::Discovering).await);

    let item = WorkItemId::new("wi-http");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !engine.is_completed(&item) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(engine.is_completed(&item));

    handle.stop().await.unwrap();
    let page = client.discover(DiscoveryQuery::new("invoice")).await.unwrap();
    assert_eq!(page.total, 0);

    server.abort();
    daemon.shutdown().await;
}
