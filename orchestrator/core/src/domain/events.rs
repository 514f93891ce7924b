// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, Capability, NodeId};
use crate::domain::message::MessageId;
use crate::domain::routing::RoutingPolicy;

/// Why a record left the routable set for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    HeartbeatExpired,
    DrainCompleted,
    Unregistered,
    /// A forced registration took over the id.
    Replaced,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::HeartbeatExpired => "heartbeat_expired",
            EvictionReason::DrainCompleted => "drain_completed",
            EvictionReason::Unregistered => "unregistered",
            EvictionReason::Replaced => "replaced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentLifecycleEvent {
    AgentRegistered {
        agent_id: AgentId,
        node_id: NodeId,
        capabilities: Vec<Capability>,
        registered_at: DateTime<Utc>,
    },
    AgentActivated {
        agent_id: AgentId,
        activated_at: DateTime<Utc>,
    },
    AgentDraining {
        agent_id: AgentId,
        inflight_count: u32,
        started_at: DateTime<Utc>,
    },
    AgentEvicted {
        agent_id: AgentId,
        reason: EvictionReason,
        evicted_at: DateTime<Utc>,
    },
    AgentPurged {
        agent_id: AgentId,
        purged_at: DateTime<Utc>,
    },
    /// A release tried to drive `inflight_count` below zero and was clamped.
    CounterUnderflow {
        agent_id: AgentId,
        attempted_delta: i64,
        observed_at: DateTime<Utc>,
    },
}

impl AgentLifecycleEvent {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentLifecycleEvent::AgentRegistered { agent_id, .. }
            | AgentLifecycleEvent::AgentActivated { agent_id, .. }
            | AgentLifecycleEvent::AgentDraining { agent_id, .. }
            | AgentLifecycleEvent::AgentEvicted { agent_id, .. }
            | AgentLifecycleEvent::AgentPurged { agent_id, .. }
            | AgentLifecycleEvent::CounterUnderflow { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoutingEvent {
    MessageRouted {
        message_id: MessageId,
        policy: RoutingPolicy,
        targets: Vec<AgentId>,
        attempts: u32,
        routed_at: DateTime<Utc>,
    },
    MessageAcknowledged {
        message_id: MessageId,
        agent_id: AgentId,
        acknowledged_at: DateTime<Utc>,
    },
    MessageRejected {
        message_id: MessageId,
        agent_id: AgentId,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    /// No ack or reject arrived within the ack timeout; the reservation was released.
    DeliveryExpired {
        message_id: MessageId,
        agent_id: AgentId,
        expired_at: DateTime<Utc>,
    },
    RoutingFailed {
        message_id: MessageId,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl RoutingEvent {
    /// Agents the event concerns; empty for events without a concrete target.
    pub fn agent_ids(&self) -> Vec<&AgentId> {
        match self {
            RoutingEvent::MessageRouted { targets, .. } => targets.iter().collect(),
            RoutingEvent::MessageAcknowledged { agent_id, .. }
            | RoutingEvent::MessageRejected { agent_id, .. }
            | RoutingEvent::DeliveryExpired { agent_id, .. } => vec![agent_id],
            RoutingEvent::RoutingFailed { .. } => vec![],
        }
    }
}
