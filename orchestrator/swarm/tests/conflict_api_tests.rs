// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `/conflicts` routes end to end, plus finality under concurrent late ballots.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bazaar_core::domain::engine::WorkItemId;
use bazaar_swarm::application::ConflictResolver;
use bazaar_swarm::domain::conflict::{BallotOutcome, ConflictBallot, ConflictState, ReviewPolicy};
use bazaar_swarm::presentation::api::conflict_router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
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
async fn test_vote_to_resolution_over_rest() {
    let app = conflict_router(Arc::new(ConflictResolver::new()));

    let (status, body) = call(
        &app,
        Method::POST,
        "/conflicts/wi-7",
        Some(json!({ "quorum": 3, "tiers": ["MAJORITY_VOTE"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "COLLECTING");

    for (voter, verdict) in [("a1", "pay"), ("a2", "hold"), ("a3", "pay")] {
        let (status, _) = call(
            &app,
            Method::POST,
            "/conflicts/wi-7/ballots",
            Some(json!({ "voterAgentId": voter, "decisionPayload": { "verdict": verdict } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&app, Method::GET, "/conflicts/wi-7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "RESOLVED");
    assert_eq!(body["decision"]["winningPayload"]["verdict"], "pay");
    assert_eq!(body["decision"]["resolutionTier"], "MAJORITY_VOTE");

    let (status, body) = call(
        &app,
        Method::POST,
        "/conflicts/wi-7/ballots",
        Some(json!({ "voterAgentId": "a4", "decisionPayload": { "verdict": "hold" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["discarded"]["state"], "RESOLVED");
}

#[tokio::test]
async fn test_rest_error_codes() {
    let app = conflict_router(Arc::new(ConflictResolver::new()));

    let (status, body) = call(&app, Method::GET, "/conflicts/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "conflict_not_found");

    let (status, _) = call(&app, Method::POST, "/conflicts/wi-1", Some(json!({ "quorum": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    call(&app, Method::POST, "/conflicts/wi-1", Some(json!({ "quorum": 2 }))).await;
    let (status, _) = call(&app, Method::POST, "/conflicts/wi-1", Some(json!({ "quorum": 2 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let ballot = json!({ "voterAgentId": "a1", "decisionPayload": true });
    call(&app, Method::POST, "/conflicts/wi-1/ballots", Some(ballot.clone())).await;
    let (status, body) = call(&app, Method::POST, "/conflicts/wi-1/ballots", Some(ballot)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "duplicate_ballot");

    let (status, _) = call(
        &app,
        Method::POST,
        "/conflicts/wi-1/arbitration",
        Some(json!({ "arbiterAgentId": "judge", "decisionPayload": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_escalation_and_fallback_queue_over_rest() {
    let app = conflict_router(Arc::new(ConflictResolver::new()));
    let policy = json!({
        "quorum": 2,
        "tiers": ["MAJORITY_VOTE", "ESCALATE", "HUMAN_FALLBACK"],
        "arbiter": "judge",
        "majorityThreshold": 0.75
    });
    call(&app, Method::POST, "/conflicts/wi-a", Some(policy)).await;
    for (voter, verdict) in [("a1", "pay"), ("a2", "hold")] {
        call(
            &app,
            Method::POST,
            "/conflicts/wi-a/ballots",
            Some(json!({ "voterAgentId": voter, "decisionPayload": verdict })),
        )
        .await;
    }
    let (_, body) = call(&app, Method::GET, "/conflicts/wi-a", None).await;
    assert_eq!(body["state"], "ESCALATED");
    assert_eq!(body["currentTier"], "ESCALATE");

    let (status, _) = call(
        &app,
        Method::POST,
        "/conflicts/wi-a/arbitration",
        Some(json!({ "arbiterAgentId": "a1", "decisionPayload": "pay" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, decision) = call(
        &app,
        Method::POST,
        "/conflicts/wi-a/arbitration",
        Some(json!({ "arbiterAgentId": "judge", "decisionPayload": "hold" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["winningPayload"], "hold");
    assert_eq!(decision["decidedBy"], "judge");

    // A split vote with no further tiers lands in the human queue
    call(
        &app,
        Method::POST,
        "/conflicts/wi-b",
        Some(json!({ "quorum": 2, "tiers": ["HUMAN_FALLBACK"] })),
    )
    .await;
    for voter in ["a1", "a2"] {
        call(
            &app,
            Method::POST,
            "/conflicts/wi-b/ballots",
            Some(json!({ "voterAgentId": voter, "decisionPayload": voter })),
        )
        .await;
    }
    let (status, queue) = call(&app, Method::GET, "/conflicts/fallback", None).await;
    assert_eq!(status, StatusCode::OK);
    let queue = queue.as_array().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0]["workItemId"], "wi-b");
    assert_eq!(queue[0]["ballots"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolution_is_final_under_concurrent_ballots() {
    let resolver = Arc::new(ConflictResolver::new());
    let item = WorkItemId::new("wi-race");
    resolver
        .open(
            item.clone(),
            ReviewPolicy {
                quorum: 5,
                ..ReviewPolicy::default()
            },
        )
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..40 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            let verdict = if i % 2 == 0 { "pay" } else { "hold" };
            resolver
                .cast(ConflictBallot::new("wi-race", format!("agent-{i}").as_str(), json!(verdict)))
                .unwrap()
        }));
    }

    let mut accepted = 0;
    let mut discarded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            BallotOutcome::Accepted { .. } => accepted += 1,
            BallotOutcome::Discarded { .. } => discarded += 1,
        }
    }

    assert_eq!(accepted, 5);
    assert_eq!(discarded, 35);
    assert_eq!(resolver.state(&item), Some(ConflictState::Resolved));
    let decision = resolver.decision(&item).unwrap();
    assert_eq!(decision.ballots_counted, 5);

    // Nothing arriving afterwards moves the outcome
    let winner = decision.winning_payload.clone();
    resolver
        .cast(ConflictBallot::new("wi-race", "late", json!("something-else")))
        .unwrap();
    assert_eq!(resolver.decision(&item).unwrap().winning_payload, winner);
}
