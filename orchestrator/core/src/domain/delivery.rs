// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Delivery Port
//!
//! Outbound handoff from the router to the external queue/transport that
//! carries messages to agent hosts. The queue is the durability boundary for
//! messages in flight; the mesh itself keeps no message store.
//!
//! Implementations live in `crate::infrastructure::delivery`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::{AgentId, NodeId};
use crate::domain::message::Message;

/// Handle returned by `enqueue`, used to acknowledge or reject the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryToken(pub Uuid);

impl DeliveryToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message addressed to one agent on one node, as handed to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub token: DeliveryToken,
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub message: Message,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{0}")]
    QueueUnavailable(String),

    #[error("unknown delivery token: {0}")]
    UnknownToken(DeliveryToken),
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Hand a message to the node hosting `agent_id`.
    async fn enqueue(&self, node_id: &NodeId, agent_id: &AgentId, message: &Message) -> Result<DeliveryToken, DeliveryError>;

    /// Recipient processed the message successfully.
    async fn acknowledge(&self, token: DeliveryToken) -> Result<(), DeliveryError>;

    /// Recipient failed to process the message.
    async fn reject(&self, token: DeliveryToken, reason: &str) -> Result<(), DeliveryError>;

    /// Envelopes enqueued and not yet acknowledged or rejected.
    fn depth(&self) -> usize;
}
