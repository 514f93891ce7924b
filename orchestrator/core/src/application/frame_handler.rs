// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mesh Frame Handler - maps agent connection frames onto the mesh use cases
//
// Any frame from a connected agent counts as a liveness signal. Frames that
// fail are answered with `Frame::Error` on the same connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::application::agent_manager::AgentManager;
use crate::application::message_router::{MessageRouter, RejectOutcome};
use crate::domain::agent::AgentId;
use crate::domain::transport::{Frame, FrameHandler};

pub struct MeshFrameHandler {
    manager: Arc<AgentManager>,
    router: Arc<MessageRouter>,
}

impl MeshFrameHandler {
    pub fn new(manager: Arc<AgentManager>, router: Arc<MessageRouter>) -> Self {
        Self { manager, router }
    }
}

fn error_frame(err: impl std::fmt::Display) -> Option<Frame> {
    Some(Frame::Error {
        message: err.to_string(),
    })
}

#[async_trait]
impl FrameHandler for MeshFrameHandler {
    async fn on_frame(&self, agent_id: &AgentId, frame: Frame) -> Option<Frame> {
        let at = match &frame {
            Frame::Heartbeat { at } => *at,
            _ => None,
        };
        if let Err(e) = self.manager.heartbeat(agent_id, at) {
            debug!(agent_id = %agent_id, error = %e, "Frame from unregistered agent");
            if matches!(frame, Frame::Heartbeat { .. }) {
                return error_frame(e);
            }
        }

        match frame {
            Frame::Heartbeat { .. } => None,
            Frame::Ack { message_id } => self.router.acknowledge(message_id, agent_id).await.err().and_then(error_frame),
            Frame::Reject {
                message_id,
                reason,
                retry,
            } => match self.router.reject(message_id, agent_id, &reason, retry).await {
                Ok(RejectOutcome::RerouteFailed(e)) => {
                    debug!(message_id = %message_id, error = %e, "Rejected message could not be re-routed");
                    None
                }
                Ok(_) => None,
                Err(e) => error_frame(e),
            },
            Frame::Send { mut message } => {
                // The connection identifies the sender
                message.from_agent_id = agent_id.clone();
                match self.router.route(message, self.router.default_context()).await {
                    Ok(_) => None,
                    Err(e) => error_frame(e),
                }
            }
            Frame::Deliver { .. } | Frame::Error { .. } => {
                warn!(agent_id = %agent_id, "Agent sent a mesh-only frame");
                error_frame("frame type is not accepted from agents")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agent_manager::RegistrationRequest;
    use crate::domain::agent::{AgentKind, Capability, NodeId};
    use crate::domain::mesh_config::{HealthConfig, RoutingConfig};
    use crate::domain::message::{Message, MessageId};
    use crate::domain::registry::AgentRegistry;
    use crate::infrastructure::delivery::InMemoryDeliveryQueue;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::registry::InMemoryAgentRegistry;
    use serde_json::json;

    fn handler() -> (Arc<AgentManager>, MeshFrameHandler) {
        let registry: Arc<dyn AgentRegistry> = Arc::new(InMemoryAgentRegistry::default());
        let bus = EventBus::new(64);
        let manager = Arc::new(AgentManager::new(registry.clone(), bus.clone(), HealthConfig::default()));
        let router = Arc::new(MessageRouter::new(
            registry,
            Arc::new(InMemoryDeliveryQueue::new(16)),
            bus,
            RoutingConfig::default(),
        ));
        manager
            .register(RegistrationRequest::new(AgentKind::Researcher, vec![], NodeId::from("node-a")).with_agent_id("r1"))
            .unwrap();
        manager
            .register(RegistrationRequest::new(AgentKind::Coordinator, vec![], NodeId::from("node-a")).with_agent_id("c1"))
            .unwrap();
        (manager.clone(), MeshFrameHandler::new(manager, router))
    }

    #[tokio::test]
    async fn test_send_then_ack_round_trip() {
        let (manager, handler) = handler();
        let c1 = AgentId::from("c1");
        let r1 = AgentId::from("r1");

        // Spoofed sender is replaced by the connection's agent id
        let message = Message::capability_routed(AgentId::from("spoofed"), Capability::new("research"), json!({}));
        let message_id = message.message_id;
        assert!(handler.on_frame(&c1, Frame::Send { message }).await.is_none());
        assert_eq!(manager.get(&r1).unwrap().inflight_count, 1);

        assert!(handler.on_frame(&r1, Frame::Ack { message_id }).await.is_none());
        assert_eq!(manager.get(&r1).unwrap().inflight_count, 0);
    }

    #[tokio::test]
    async fn test_failures_reply_with_error_frames() {
        let (_manager, handler) = handler();
        let r1 = AgentId::from("r1");

        let reply = handler
            .on_frame(
                &r1,
                Frame::Ack {
                    message_id: MessageId::new(),
                },
            )
            .await;
        assert!(matches!(reply, Some(Frame::Error { .. })));

        let reply = handler.on_frame(&AgentId::from("ghost"), Frame::Heartbeat { at: None }).await;
        assert!(matches!(reply, Some(Frame::Error { .. })));

        let reply = handler
            .on_frame(
                &r1,
                Frame::Error {
                    message: "nope".to_string(),
                },
            )
            .await;
        assert!(matches!(reply, Some(Frame::Error { .. })));
    }
}
