// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::application::registry::{RegistryApi, RegistryService};
use crate::domain::agent::{AgentId, AgentRecord, Capability, DiscoveryPage, DiscoveryQuery, PublishRequest};
use crate::domain::error::{ErrorClass, MarketplaceError};
use crate::domain::handoff::{HandoffAck, HandoffGrant, HandoffRequest};
use crate::domain::lease::LeaseId;

pub struct ApiState {
    pub registry: RegistryService,
    pub started_at: Instant,
}

/// REST surface of the registry.
pub fn registry_router(registry: RegistryService) -> Router {
    let state = Arc::new(ApiState {
        registry,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/agents", post(publish_agent).get(discover_agents))
        .route("/agents/{id}", get(get_agent).delete(unpublish_agent))
        .route("/agents/{id}/lease", put(renew_lease))
        .route("/handoff", post(request_handoff))
        .route("/handoff/{token}/ack", post(acknowledge_handoff))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Error body returned by every failing route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub class: ErrorClass,
}

pub struct ApiError(pub MarketplaceError);

impl From<MarketplaceError> for ApiError {
    fn from(err: MarketplaceError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &MarketplaceError) -> StatusCode {
    match err {
        MarketplaceError::DuplicateAgentId(_) => StatusCode::CONFLICT,
        MarketplaceError::LeaseNotFound(_)
        | MarketplaceError::AgentNotFound(_)
        | MarketplaceError::TargetNotLive(_) => StatusCode::NOT_FOUND,
        MarketplaceError::TokenInvalid(_) => StatusCode::GONE,
        MarketplaceError::TokenSignature(_) => StatusCode::UNAUTHORIZED,
        MarketplaceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MarketplaceError::Timeout { .. } | MarketplaceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MarketplaceError::Store(e) => match e.class() {
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Expired => StatusCode::NOT_FOUND,
            ErrorClass::Fatal => StatusCode::BAD_REQUEST,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Registry request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            class: self.0.class(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseBody {
    pub lease_id: LeaseId,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverParams {
    pub capability: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckParams {
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBody {
    pub status: String,
    pub live_agents: usize,
    pub degraded: bool,
    pub uptime_seconds: u64,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthBody> {
    let marketplace = state.registry.marketplace();
    let degraded = marketplace.is_degraded();
    Json(HealthBody {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        live_agents: marketplace.live_count(),
        degraded,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn publish_agent(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<LeaseBody>, ApiError> {
    let lease_id = state.registry.publish(request).await?;
    Ok(Json(LeaseBody { lease_id }))
}

async fn discover_agents(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<DiscoveryPage>, ApiError> {
    let mut query = DiscoveryQuery::new(Capability::new(params.capability));
    if let Some(limit) = params.limit {
        query.limit = limit;
    }
    query.offset = params.offset.unwrap_or(0);
    Ok(Json(state.registry.discover(query).await?))
}

async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    let agent_id = AgentId::parse(&id).map_err(MarketplaceError::from)?;
    Ok(Json(state.registry.marketplace().get(&agent_id)?))
}

async fn renew_lease(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<LeaseBody>,
) -> Result<StatusCode, ApiError> {
    let agent_id = AgentId::parse(&id).map_err(MarketplaceError::from)?;
    state.registry.renew(&agent_id, body.lease_id).await?;
    Ok(StatusCode::OK)
}

async fn unpublish_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let agent_id = AgentId::parse(&id).map_err(MarketplaceError::from)?;
    state.registry.unpublish(&agent_id).await?;
    Ok(StatusCode::OK)
}

async fn request_handoff(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<HandoffRequest>,
) -> Result<Json<HandoffGrant>, ApiError> {
    Ok(Json(state.registry.request_handoff(request).await?))
}

async fn acknowledge_handoff(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
    Query(params): Query<AckParams>,
) -> Result<Json<HandoffAck>, ApiError> {
    let ack = state
        .registry
        .acknowledge_handoff(&token, params.agent_id.as_ref())
        .await?;
    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::LeaseStoreError;

    #[test]
    fn test_status_mapping() {
        let id = AgentId::new("a1");
        assert_eq!(status_for(&MarketplaceError::DuplicateAgentId(id.clone())), StatusCode::CONFLICT);
        assert_eq!(status_for(&MarketplaceError::LeaseNotFound(id.clone())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MarketplaceError::TargetNotLive(id)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&MarketplaceError::TokenInvalid("used".into())), StatusCode::GONE);
        assert_eq!(
            status_for(&MarketplaceError::TokenSignature("bad".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&MarketplaceError::Store(LeaseStoreError::Unavailable("down".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
