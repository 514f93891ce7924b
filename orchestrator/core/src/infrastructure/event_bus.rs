// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Mesh Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Subscribers see registry lifecycle changes and routing outcomes as they
// happen. Events are not persisted; a lagging subscriber loses the oldest.

use crate::domain::agent::AgentId;
use crate::domain::events::{AgentLifecycleEvent, RoutingEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified mesh event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    AgentLifecycle(AgentLifecycleEvent),
    Routing(RoutingEvent),
}

impl MeshEvent {
    /// Whether the event concerns `agent_id`.
    pub fn concerns(&self, agent_id: &AgentId) -> bool {
        match self {
            MeshEvent::AgentLifecycle(event) => event.agent_id() == agent_id,
            MeshEvent::Routing(event) => event.agent_ids().contains(&agent_id),
        }
    }
}

/// Event bus for publishing and subscribing to mesh events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<MeshEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_agent_event(&self, event: AgentLifecycleEvent) {
        self.publish(MeshEvent::AgentLifecycle(event));
    }

    pub fn publish_routing_event(&self, event: RoutingEvent) {
        self.publish(MeshEvent::Routing(event));
    }

    fn publish(&self, event: MeshEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all mesh events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events that concern a single agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all mesh events
pub struct EventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for agent-specific events (filtered)
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    /// Receive the next event concerning the subscribed agent
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.concerns(&self.agent_id) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EvictionReason;
    use crate::domain::message::MessageId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_agent_event(AgentLifecycleEvent::AgentActivated {
            agent_id: AgentId::from("r1"),
            activated_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            MeshEvent::AgentLifecycle(AgentLifecycleEvent::AgentActivated { agent_id, .. }) => {
                assert_eq!(agent_id.as_str(), "r1");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_agent(AgentId::from("a2"));

        event_bus.publish_agent_event(AgentLifecycleEvent::AgentEvicted {
            agent_id: AgentId::from("a1"),
            reason: EvictionReason::HeartbeatExpired,
            evicted_at: Utc::now(),
        });
        event_bus.publish_routing_event(RoutingEvent::MessageRouted {
            message_id: MessageId::new(),
            policy: crate::domain::routing::RoutingPolicy::Broadcast,
            targets: vec![AgentId::from("a3"), AgentId::from("a2")],
            attempts: 1,
            routed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            MeshEvent::Routing(RoutingEvent::MessageRouted { targets, .. }) => {
                assert_eq!(targets.len(), 2);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_agent_event(AgentLifecycleEvent::AgentPurged {
            agent_id: AgentId::from("x"),
            purged_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
