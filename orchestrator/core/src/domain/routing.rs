// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Routing Value Objects
//!
//! - [`RoutingDecision`]: ephemeral result of resolving a message to targets.
//! - [`LoadSnapshot`]: per-agent load view derived on demand from the registry.
//! - [`Reservation`]: one unit of `inflight_count` claimed at selection time.
//! - [`RoutingError`]: failure taxonomy surfaced by the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;
use tokio::time::Instant;

use crate::domain::agent::{AgentDescriptor, AgentId, AgentState, NodeId};
use crate::domain::delivery::{DeliveryError, DeliveryToken};
use crate::domain::message::{MessageError, MessageId};

/// Policy that produced a [`RoutingDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    DirectLookup,
    LeastLoaded,
    Broadcast,
}

/// Claim on one in-flight slot of a specific registered instance.
///
/// The instance number pins the claim to the registration that granted it;
/// releasing against a replaced instance is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    pub agent_id: AgentId,
    pub instance: u64,
}

/// One concrete destination of a routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub token: DeliveryToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub agent_id: AgentId,
    pub reason: String,
}

/// Outcome of a routing lookup. Never persisted.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub message_id: MessageId,
    pub targets: Vec<RouteTarget>,
    /// Broadcast targets whose handoff failed; always empty for other modes.
    pub failed: Vec<FailedTarget>,
    pub policy: RoutingPolicy,
    /// Routing attempts consumed to reach this decision.
    pub attempts: u32,
    /// Monotonic decision time.
    pub decided_at: Instant,
    pub decided_at_utc: DateTime<Utc>,
}

impl RoutingDecision {
    pub fn new(message_id: MessageId, policy: RoutingPolicy, targets: Vec<RouteTarget>, attempts: u32) -> Self {
        Self {
            message_id,
            targets,
            failed: Vec::new(),
            policy,
            attempts,
            decided_at: Instant::now(),
            decided_at_utc: Utc::now(),
        }
    }

    /// First (and for non-broadcast decisions, only) target.
    pub fn primary(&self) -> Option<&RouteTarget> {
        self.targets.first()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.targets.iter().map(|t| t.agent_id.clone()).collect()
    }
}

/// Load view consumed by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub agent_id: AgentId,
    pub inflight_count: u32,
    pub capacity_hint: Option<u32>,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub instance: u64,
}

impl LoadSnapshot {
    pub fn has_headroom(&self) -> bool {
        self.capacity_hint
            .map(|cap| self.inflight_count < cap)
            .unwrap_or(true)
    }

    /// Least-loaded first; ties go to the earliest registration.
    pub fn selection_order(&self, other: &Self) -> Ordering {
        self.inflight_count
            .cmp(&other.inflight_count)
            .then(self.registered_at.cmp(&other.registered_at))
            .then(self.instance.cmp(&other.instance))
    }
}

impl From<&AgentDescriptor> for LoadSnapshot {
    fn from(descriptor: &AgentDescriptor) -> Self {
        Self {
            agent_id: descriptor.agent_id.clone(),
            inflight_count: descriptor.inflight_count,
            capacity_hint: descriptor.capacity_hint,
            state: descriptor.state,
            registered_at: descriptor.registered_at,
            instance: descriptor.instance,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoutingError {
    #[error("agent not found: {0}")]
    NotFound(AgentId),

    #[error("agent {agent_id} is unavailable (state: {state})")]
    AgentUnavailable { agent_id: AgentId, state: AgentState },

    #[error("no capable agent for {0}")]
    NoCapableAgent(String),

    #[error("all {candidates} candidate agents are at capacity")]
    Overloaded { candidates: usize },

    #[error("delivery queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("routing deadline exceeded")]
    Timeout,

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),

    #[error("router is shutting down")]
    ShuttingDown,

    #[error("no pending delivery of message {message_id} to {agent_id}")]
    UnknownDelivery { message_id: MessageId, agent_id: AgentId },

    #[error("routing failed after {attempts} attempts: {last_cause}")]
    RoutingFailed { attempts: u32, last_cause: Box<RoutingError> },
}

impl RoutingError {
    /// Errors retried internally with backoff before being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RoutingError::Overloaded { .. }
                | RoutingError::NoCapableAgent(_)
                | RoutingError::QueueUnavailable(_)
                | RoutingError::Timeout
        )
    }

    /// Short machine-readable name, used for metric labels and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::NotFound(_) => "not_found",
            RoutingError::AgentUnavailable { .. } => "agent_unavailable",
            RoutingError::NoCapableAgent(_) => "no_capable_agent",
            RoutingError::Overloaded { .. } => "overloaded",
            RoutingError::QueueUnavailable(_) => "queue_unavailable",
            RoutingError::Timeout => "timeout",
            RoutingError::InvalidMessage(_) => "invalid_message",
            RoutingError::ShuttingDown => "shutting_down",
            RoutingError::UnknownDelivery { .. } => "unknown_delivery",
            RoutingError::RoutingFailed { .. } => "routing_failed",
        }
    }

    /// The innermost cause, unwrapping `RoutingFailed`.
    pub fn root_cause(&self) -> &RoutingError {
        match self {
            RoutingError::RoutingFailed { last_cause, .. } => last_cause.root_cause(),
            other => other,
        }
    }
}

impl From<DeliveryError> for RoutingError {
    fn from(err: DeliveryError) -> Self {
        RoutingError::QueueUnavailable(err.to_string())
    }
}
