// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transport Port
//!
//! Per-agent duplex channel between a connected agent and the mesh. The wire
//! format (WebSocket or otherwise) is outside the core; this module defines
//! the frames exchanged and the two operations the core relies on.
//!
//! Any inbound frame counts as a heartbeat for the sending agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::agent::AgentId;
use crate::domain::delivery::Envelope;
use crate::domain::message::{Message, MessageId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Explicit liveness signal. `at` defaults to the receive time.
    Heartbeat {
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Ack {
        message_id: MessageId,
    },
    Reject {
        message_id: MessageId,
        reason: String,
        #[serde(default)]
        retry: bool,
    },
    /// Agent-originated message to be routed.
    Send {
        message: Message,
    },
    /// Mesh → agent: a message to process.
    Deliver {
        envelope: Envelope,
    },
    /// Mesh → agent: reply to a frame that could not be honoured.
    Error {
        message: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("agent {0} is not connected")]
    NotConnected(AgentId),

    #[error("outbound buffer for agent {0} is full")]
    Backpressure(AgentId),

    #[error("agent {0} is already connected")]
    AlreadyConnected(AgentId),
}

/// Consumer of inbound frames for one connection.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one frame; a returned frame is sent back on the same connection.
    async fn on_frame(&self, agent_id: &AgentId, frame: Frame) -> Option<Frame>;
}

pub trait Transport: Send + Sync {
    /// Queue a frame for the agent without waiting for buffer space.
    fn send(&self, agent_id: &AgentId, frame: Frame) -> Result<(), TransportError>;

    /// Start draining the agent's inbound frames into `handler`.
    fn on_receive(&self, agent_id: &AgentId, handler: Arc<dyn FrameHandler>) -> Result<(), TransportError>;
}
