// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Inter-Agent Messages
//!
//! A [`Message`] is the unit the router moves between agents. The payload is
//! opaque to the mesh; only the addressing fields are interpreted.
//!
//! Addressing invariant: exactly one of `to_agent_id` / `capability` is set,
//! except for [`DeliveryMode::Broadcast`] where both may be absent (all Active
//! agents) or only `capability` is set (all Active agents with that tag).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::{AgentId, Capability};

/// Unique message identifier, used for deduplication and ack correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Direct,
    Broadcast,
    CapabilityRouted,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Direct => "direct",
            DeliveryMode::Broadcast => "broadcast",
            DeliveryMode::CapabilityRouted => "capability_routed",
        }
    }
}

/// Conversational role of a message. Carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Request,
    Response,
    Notification,
    Error,
}

/// Delivery progress of a message as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Dispatched,
    Acknowledged,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub from_agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    pub payload: serde_json::Value,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("direct message requires to_agent_id and must not carry a capability")]
    DirectAddressing,

    #[error("capability-routed message requires a capability and must not carry to_agent_id")]
    CapabilityAddressing,

    #[error("broadcast message must not carry to_agent_id")]
    BroadcastAddressing,

    #[error("capability tag is empty")]
    EmptyCapability,
}

impl Message {
    fn base(from: AgentId, mode: DeliveryMode, payload: serde_json::Value) -> Self {
        Self {
            message_id: MessageId::new(),
            from_agent_id: from,
            to_agent_id: None,
            capability: None,
            payload,
            delivery_mode: mode,
            kind: MessageKind::Request,
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }

    pub fn direct(from: AgentId, to: AgentId, payload: serde_json::Value) -> Self {
        Self {
            to_agent_id: Some(to),
            ..Self::base(from, DeliveryMode::Direct, payload)
        }
    }

    pub fn capability_routed(from: AgentId, capability: Capability, payload: serde_json::Value) -> Self {
        Self {
            capability: Some(capability),
            ..Self::base(from, DeliveryMode::CapabilityRouted, payload)
        }
    }

    pub fn broadcast(from: AgentId, capability: Option<Capability>, payload: serde_json::Value) -> Self {
        Self {
            capability,
            ..Self::base(from, DeliveryMode::Broadcast, payload)
        }
    }

    pub fn with_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Check the addressing invariant for the message's delivery mode.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.capability.as_ref().is_some_and(Capability::is_empty) {
            return Err(MessageError::EmptyCapability);
        }
        match self.delivery_mode {
            DeliveryMode::Direct => {
                if self.to_agent_id.is_none() || self.capability.is_some() {
                    return Err(MessageError::DirectAddressing);
                }
            }
            DeliveryMode::CapabilityRouted => {
                if self.capability.is_none() || self.to_agent_id.is_some() {
                    return Err(MessageError::CapabilityAddressing);
                }
            }
            DeliveryMode::Broadcast => {
                if self.to_agent_id.is_some() {
                    return Err(MessageError::BroadcastAddressing);
                }
            }
        }
        Ok(())
    }
}
