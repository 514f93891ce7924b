// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Administrative HTTP surface of the coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::application::agent_manager::{AgentManager, RegistrationRequest};
use crate::application::discovery::{DiscoveryQuery, DiscoveryService};
use crate::application::message_router::{MessageRouter, PendingRoute, RejectOutcome, RouteContext};
use crate::domain::agent::{AgentDescriptor, AgentId, AgentKind, AgentState, Capability, NodeId};
use crate::domain::delivery::{DeliveryQueue, Envelope};
use crate::domain::message::{DeliveryMode, Message, MessageId, MessageKind};
use crate::domain::registry::{HeartbeatOutcome, RegistryError, StateCounts};
use crate::domain::routing::{FailedTarget, RouteTarget, RoutingDecision, RoutingError, RoutingPolicy};
use crate::infrastructure::delivery::InMemoryDeliveryQueue;

const DEFAULT_POLL_BATCH: usize = 32;

pub struct AppState {
    pub manager: Arc<AgentManager>,
    pub router: Arc<MessageRouter>,
    pub discovery: Arc<DiscoveryService>,
    pub queue: Arc<InMemoryDeliveryQueue>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        manager: Arc<AgentManager>,
        router: Arc<MessageRouter>,
        discovery: Arc<DiscoveryService>,
        queue: Arc<InMemoryDeliveryQueue>,
    ) -> Self {
        Self {
            manager,
            router,
            discovery,
            queue,
            started_at: Instant::now(),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agents", get(list_agents_handler))
        .route("/agents/register", post(register_agent_handler))
        .route("/agents/{agent_id}", get(get_agent_handler).delete(remove_agent_handler))
        .route("/agents/{agent_id}/heartbeat", post(heartbeat_handler))
        .route("/agents/{agent_id}/drain", post(drain_agent_handler))
        .route("/capabilities", get(capabilities_handler))
        .route("/messages/send", post(send_message_handler))
        .route("/messages/{message_id}", get(message_status_handler))
        .route("/messages/{message_id}/ack", post(ack_message_handler))
        .route("/messages/{message_id}/reject", post(reject_message_handler))
        .route("/nodes/{node_id}/deliveries", get(poll_deliveries_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Registry(e) => match e {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::DuplicateActiveRegistration { .. } | RegistryError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                RegistryError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            },
            ApiError::Routing(e) => match e.root_cause() {
                RoutingError::NotFound(_) | RoutingError::NoCapableAgent(_) | RoutingError::UnknownDelivery { .. } => {
                    StatusCode::NOT_FOUND
                }
                RoutingError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
                RoutingError::AgentUnavailable { .. }
                | RoutingError::QueueUnavailable(_)
                | RoutingError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                RoutingError::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
                RoutingError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                RoutingError::RoutingFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Registry(e) => e.kind(),
            ApiError::Routing(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub state: AgentState,
    pub node_id: NodeId,
    pub capabilities: Vec<Capability>,
    pub inflight_count: u32,
    #[serde(default)]
    pub capacity_hint: Option<u32>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<&AgentDescriptor> for AgentSummary {
    fn from(d: &AgentDescriptor) -> Self {
        Self {
            agent_id: d.agent_id.clone(),
            name: d.name.clone(),
            kind: d.kind,
            state: d.state,
            node_id: d.node_id.clone(),
            capabilities: d.capabilities.iter().cloned().collect(),
            inflight_count: d.inflight_count,
            capacity_hint: d.capacity_hint,
            last_heartbeat_at: d.last_heartbeat_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub drain: bool,
}

/// Body of `POST /messages/send`. The delivery mode is inferred from the
/// addressing fields when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub from_agent_id: AgentId,
    #[serde(default)]
    pub to_agent_id: Option<AgentId>,
    #[serde(default)]
    pub capability: Option<Capability>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub kind: MessageKind,
    /// Overrides the configured route deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SendMessageRequest {
    fn into_message(self) -> Message {
        let mode = self.delivery_mode.unwrap_or(match (&self.to_agent_id, &self.capability) {
            (Some(_), _) => DeliveryMode::Direct,
            (None, Some(_)) => DeliveryMode::CapabilityRouted,
            (None, None) => DeliveryMode::Broadcast,
        });
        Message {
            message_id: self.message_id.unwrap_or_default(),
            from_agent_id: self.from_agent_id,
            to_agent_id: self.to_agent_id,
            capability: self.capability,
            payload: self.payload,
            delivery_mode: mode,
            kind: self.kind,
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecisionResponse {
    pub message_id: MessageId,
    pub policy: RoutingPolicy,
    pub attempts: u32,
    pub targets: Vec<RouteTarget>,
    #[serde(default)]
    pub failed: Vec<FailedTarget>,
    pub decided_at: DateTime<Utc>,
}

impl From<RoutingDecision> for RoutingDecisionResponse {
    fn from(decision: RoutingDecision) -> Self {
        Self {
            message_id: decision.message_id,
            policy: decision.policy,
            attempts: decision.attempts,
            targets: decision.targets,
            failed: decision.failed,
            decided_at: decision.decided_at_utc,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub retry: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectResponse {
    pub status: String,
    #[serde(default)]
    pub decision: Option<RoutingDecisionResponse>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub active_agents: usize,
    pub agents_by_state: StateCounts,
    pub queue_depth: usize,
    pub pending_deliveries: usize,
    pub messages_routed: u64,
    pub routing_failures: u64,
    pub duplicates: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub expired: u64,
    pub failure_rate: f64,
    pub uptime_seconds: u64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.router.is_closed() { "shutting_down" } else { "healthy" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn list_agents_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiscoveryQuery>,
) -> Json<Vec<AgentSummary>> {
    let agents = state.discovery.find(&query);
    Json(agents.iter().map(AgentSummary::from).collect())
}

async fn get_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<AgentDescriptor> {
    Ok(Json(state.manager.get(&agent_id)?))
}

async fn register_agent_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<AgentDescriptor>), ApiError> {
    let descriptor = state.manager.register(request)?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

async fn remove_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<AgentId>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<AgentSummary> {
    let descriptor = state.manager.remove(&agent_id, query.drain)?;
    Ok(Json(AgentSummary::from(&descriptor)))
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<AgentId>,
    body: Bytes,
) -> ApiResult<serde_json::Value> {
    let request = if body.is_empty() {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice::<HeartbeatRequest>(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let outcome = state.manager.heartbeat(&agent_id, request.at)?;
    Ok(Json(json!({
        "agent_id": agent_id,
        "applied": outcome == HeartbeatOutcome::Applied,
    })))
}

async fn drain_agent_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<AgentId>,
) -> ApiResult<AgentSummary> {
    let descriptor = state.manager.begin_drain(&agent_id)?;
    Ok(Json(AgentSummary::from(&descriptor)))
}

async fn capabilities_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(state.discovery.capability_catalog()))
}

async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<RoutingDecisionResponse> {
    let ctx = match request.timeout_ms {
        Some(ms) => RouteContext::with_timeout(Duration::from_millis(ms)),
        None => state.router.default_context(),
    };
    let decision = state.router.route(request.into_message(), ctx).await?;
    Ok(Json(decision.into()))
}

async fn message_status_handler(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
) -> ApiResult<PendingRoute> {
    state
        .router
        .pending(message_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no outstanding deliveries for message {}", message_id)))
}

async fn ack_message_handler(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
    Json(request): Json<AckRequest>,
) -> ApiResult<serde_json::Value> {
    state.router.acknowledge(message_id, &request.agent_id).await?;
    Ok(Json(json!({
        "message_id": message_id,
        "agent_id": request.agent_id,
        "status": "acknowledged",
    })))
}

async fn reject_message_handler(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<MessageId>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<RejectResponse> {
    let outcome = state
        .router
        .reject(message_id, &request.agent_id, &request.reason, request.retry)
        .await?;
    let response = match outcome {
        RejectOutcome::Settled => RejectResponse {
            status: "rejected".to_string(),
            decision: None,
            error: None,
        },
        RejectOutcome::Rerouted(decision) => RejectResponse {
            status: "rerouted".to_string(),
            decision: Some(decision.into()),
            error: None,
        },
        RejectOutcome::RerouteFailed(e) => RejectResponse {
            status: "reroute_failed".to_string(),
            decision: None,
            error: Some(e.to_string()),
        },
    };
    Ok(Json(response))
}

async fn poll_deliveries_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
    Query(query): Query<PollQuery>,
) -> Json<Vec<Envelope>> {
    Json(state.queue.poll(&node_id, query.max.unwrap_or(DEFAULT_POLL_BATCH)))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let counts = state.manager.registry().counts();
    let stats = state.router.stats();
    Json(MetricsResponse {
        active_agents: counts.active,
        agents_by_state: counts,
        queue_depth: state.queue.depth(),
        pending_deliveries: stats.pending,
        messages_routed: stats.routed,
        routing_failures: stats.failed,
        duplicates: stats.duplicates,
        acknowledged: stats.acknowledged,
        rejected: stats.rejected,
        expired: stats.expired,
        failure_rate: stats.failure_rate(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
