// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use bazaar_core::domain::agent::AgentId;
use bazaar_core::domain::engine::WorkItemId;
use bazaar_core::presentation::api::ErrorBody;

use crate::application::ConflictResolver;
use crate::domain::conflict::{
    BallotOutcome, ConflictBallot, ConflictDecision, ConflictError, ConflictStatus, FallbackItem, ReviewPolicy,
};

/// `/conflicts` routes, merged into the registry daemon's router.
pub fn conflict_router(resolver: Arc<ConflictResolver>) -> Router {
    Router::new()
        .route("/conflicts/fallback", get(list_fallback))
        .route("/conflicts/{work_item_id}", post(open_case).get(get_case))
        .route("/conflicts/{work_item_id}/ballots", post(cast_ballot))
        .route("/conflicts/{work_item_id}/arbitration", post(arbitrate))
        .with_state(resolver)
}

pub struct ConflictApiError(pub ConflictError);

impl From<ConflictError> for ConflictApiError {
    fn from(err: ConflictError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &ConflictError) -> StatusCode {
    match err {
        ConflictError::NotFound(_) => StatusCode::NOT_FOUND,
        ConflictError::AlreadyOpen(_)
        | ConflictError::Closed(_)
        | ConflictError::DuplicateBallot { .. }
        | ConflictError::NotEscalated(_) => StatusCode::CONFLICT,
        ConflictError::NotArbiter { .. } => StatusCode::FORBIDDEN,
        ConflictError::InvalidPolicy(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ConflictApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            class: self.0.class(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotBody {
    pub voter_agent_id: AgentId,
    pub decision_payload: serde_json::Value,
    /// Defaults to the time the registry receives the ballot.
    #[serde(default)]
    pub cast_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationBody {
    pub arbiter_agent_id: AgentId,
    pub decision_payload: serde_json::Value,
}

async fn open_case(
    State(resolver): State<Arc<ConflictResolver>>,
    Path(work_item_id): Path<String>,
    Json(policy): Json<ReviewPolicy>,
) -> Result<Json<ConflictStatus>, ConflictApiError> {
    Ok(Json(resolver.open(WorkItemId::new(work_item_id), policy)?))
}

async fn get_case(
    State(resolver): State<Arc<ConflictResolver>>,
    Path(work_item_id): Path<String>,
) -> Result<Json<ConflictStatus>, ConflictApiError> {
    let work_item_id = WorkItemId::new(work_item_id);
    resolver
        .status(&work_item_id)
        .map(Json)
        .ok_or(ConflictApiError(ConflictError::NotFound(work_item_id)))
}

async fn cast_ballot(
    State(resolver): State<Arc<ConflictResolver>>,
    Path(work_item_id): Path<String>,
    Json(body): Json<BallotBody>,
) -> Result<Json<BallotOutcome>, ConflictApiError> {
    let ballot = ConflictBallot {
        work_item_id: WorkItemId::new(work_item_id),
        voter_agent_id: body.voter_agent_id,
        decision_payload: body.decision_payload,
        cast_at: body.cast_at.unwrap_or_else(Utc::now),
        confidence: body.confidence,
    };
    Ok(Json(resolver.cast(ballot)?))
}

async fn arbitrate(
    State(resolver): State<Arc<ConflictResolver>>,
    Path(work_item_id): Path<String>,
    Json(body): Json<ArbitrationBody>,
) -> Result<Json<ConflictDecision>, ConflictApiError> {
    let decision = resolver.arbitrate(
        &WorkItemId::new(work_item_id),
        &body.arbiter_agent_id,
        body.decision_payload,
    )?;
    Ok(Json(decision))
}

async fn list_fallback(State(resolver): State<Arc<ConflictResolver>>) -> Json<Vec<FallbackItem>> {
    Json(resolver.pending_fallback())
}
