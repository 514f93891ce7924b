// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Delivery Queue
//
// Per-node bounded buffers standing in for an external broker. Agent hosts
// pull envelopes with `poll`; an envelope stays pending until it is
// acknowledged or rejected, so `depth` counts both undelivered and
// unacknowledged messages.
//
// With a transport attached, an envelope for a connected agent is pushed as
// `Frame::Deliver` instead of buffered. A push that fails falls back to the
// node buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentId, NodeId};
use crate::domain::delivery::{DeliveryError, DeliveryQueue, DeliveryToken, Envelope};
use crate::domain::message::Message;
use crate::domain::transport::{Frame, Transport};
use crate::infrastructure::metrics;

#[derive(Default)]
struct QueueState {
    buffers: HashMap<NodeId, VecDeque<Envelope>>,
    pending: HashMap<DeliveryToken, Envelope>,
}

impl QueueState {
    /// Drop a settled envelope from its node buffer if it was never polled.
    fn forget(&mut self, envelope: &Envelope) {
        if let Some(buffer) = self.buffers.get_mut(&envelope.node_id) {
            buffer.retain(|e| e.token != envelope.token);
        }
    }
}

pub struct InMemoryDeliveryQueue {
    per_node_capacity: usize,
    state: Mutex<QueueState>,
    closed: AtomicBool,
    transport: Option<Arc<dyn Transport>>,
}

impl InMemoryDeliveryQueue {
    pub fn new(per_node_capacity: usize) -> Self {
        Self {
            per_node_capacity,
            state: Mutex::new(QueueState::default()),
            closed: AtomicBool::new(false),
            transport: None,
        }
    }

    /// Push envelopes to connected agents over `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn push(&self, envelope: &Envelope) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        let frame = Frame::Deliver {
            envelope: envelope.clone(),
        };
        match transport.send(&envelope.agent_id, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(agent_id = %envelope.agent_id, error = %e, "Push unavailable, buffering envelope");
                false
            }
        }
    }

    /// Hand up to `max` buffered envelopes to the node, oldest first.
    pub fn poll(&self, node_id: &NodeId, max: usize) -> Vec<Envelope> {
        let mut state = self.state.lock();
        let Some(buffer) = state.buffers.get_mut(node_id) else {
            return Vec::new();
        };
        let take = max.min(buffer.len());
        let batch: Vec<Envelope> = buffer.drain(..take).collect();
        if !batch.is_empty() {
            debug!(node_id = %node_id, count = batch.len(), "Envelopes handed to node");
        }
        batch
    }

    /// Buffered, not yet polled envelopes for one node.
    pub fn buffered(&self, node_id: &NodeId) -> usize {
        self.state.lock().buffers.get(node_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Refuse further enqueues. Pending envelopes can still be settled.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Delivery queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn settle(&self, token: DeliveryToken) -> Result<Envelope, DeliveryError> {
        let mut state = self.state.lock();
        let envelope = state
            .pending
            .remove(&token)
            .ok_or(DeliveryError::UnknownToken(token))?;
        state.forget(&envelope);
        ::metrics::gauge!(metrics::DELIVERY_QUEUE_DEPTH).set(state.pending.len() as f64);
        Ok(envelope)
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, node_id: &NodeId, agent_id: &AgentId, message: &Message) -> Result<DeliveryToken, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::QueueUnavailable("delivery queue is closed".to_string()));
        }

        let envelope = Envelope {
            token: DeliveryToken::new(),
            agent_id: agent_id.clone(),
            node_id: node_id.clone(),
            message: message.clone(),
            enqueued_at: Utc::now(),
        };
        let token = envelope.token;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pushed = self.push(&envelope);
        if !pushed {
            let buffer = state.buffers.entry(node_id.clone()).or_default();
            if buffer.len() >= self.per_node_capacity {
                warn!(node_id = %node_id, capacity = self.per_node_capacity, "Node delivery buffer full");
                return Err(DeliveryError::QueueUnavailable(format!(
                    "delivery buffer for node {} is full",
                    node_id
                )));
            }
            buffer.push_back(envelope.clone());
        }
        state.pending.insert(token, envelope);
        ::metrics::gauge!(metrics::DELIVERY_QUEUE_DEPTH).set(state.pending.len() as f64);

        debug!(
            message_id = %message.message_id,
            agent_id = %agent_id,
            node_id = %node_id,
            pushed,
            "Message enqueued"
        );
        Ok(token)
    }

    async fn acknowledge(&self, token: DeliveryToken) -> Result<(), DeliveryError> {
        let envelope = self.settle(token)?;
        debug!(message_id = %envelope.message.message_id, agent_id = %envelope.agent_id, "Delivery acknowledged");
        Ok(())
    }

    async fn reject(&self, token: DeliveryToken, reason: &str) -> Result<(), DeliveryError> {
        let envelope = self.settle(token)?;
        debug!(
            message_id = %envelope.message.message_id,
            agent_id = %envelope.agent_id,
            reason,
            "Delivery rejected"
        );
        Ok(())
    }

    fn depth(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::Capability;
    use crate::infrastructure::transport::ConnectionHub;
    use serde_json::json;

    fn message() -> Message {
        Message::capability_routed(AgentId::from("c1"), Capability::new("research"), json!({"q": "x"}))
    }

    #[tokio::test]
    async fn test_enqueue_poll_ack() {
        let queue = InMemoryDeliveryQueue::new(8);
        let node = NodeId::from("node-a");
        let token = queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();

        assert_eq!(queue.depth(), 1);
        let batch = queue.poll(&node, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].token, token);
        assert!(queue.poll(&node, 10).is_empty());

        // Polled but unacknowledged envelopes still count
        assert_eq!(queue.depth(), 1);
        queue.acknowledge(token).await.unwrap();
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.acknowledge(token).await, Err(DeliveryError::UnknownToken(token)));
    }

    #[tokio::test]
    async fn test_full_buffer_reports_unavailable() {
        let queue = InMemoryDeliveryQueue::new(1);
        let node = NodeId::from("node-a");
        queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();

        let err = queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::QueueUnavailable(_)));

        // Other nodes have their own buffer
        queue
            .enqueue(&NodeId::from("node-b"), &AgentId::from("r2"), &message())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reject_before_poll_removes_buffered_envelope() {
        let queue = InMemoryDeliveryQueue::new(4);
        let node = NodeId::from("node-a");
        let token = queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();

        queue.reject(token, "busy").await.unwrap();
        assert_eq!(queue.buffered(&node), 0);
        assert!(queue.poll(&node, 10).is_empty());
    }

    #[tokio::test]
    async fn test_connected_agent_receives_pushed_envelope() {
        let hub = Arc::new(ConnectionHub::new(1));
        let queue = InMemoryDeliveryQueue::new(4).with_transport(hub.clone());
        let node = NodeId::from("node-a");
        let mut conn = hub.connect(AgentId::from("r1")).unwrap();

        let token = queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();
        match conn.recv().await {
            Some(Frame::Deliver { envelope }) => assert_eq!(envelope.token, token),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(queue.buffered(&node), 0);
        assert_eq!(queue.depth(), 1);

        // Not connected: buffered for polling
        let other = queue.enqueue(&node, &AgentId::from("r2"), &message()).await.unwrap();
        assert_eq!(queue.poll(&node, 10)[0].token, other);

        queue.acknowledge(token).await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_push_backpressure_falls_back_to_buffer() {
        let hub = Arc::new(ConnectionHub::new(1));
        let queue = InMemoryDeliveryQueue::new(4).with_transport(hub.clone());
        let node = NodeId::from("node-a");
        let _conn = hub.connect(AgentId::from("r1")).unwrap();

        queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();
        let second = queue.enqueue(&node, &AgentId::from("r1"), &message()).await.unwrap();

        assert_eq!(queue.buffered(&node), 1);
        assert_eq!(queue.poll(&node, 10)[0].token, second);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_enqueue() {
        let queue = InMemoryDeliveryQueue::new(4);
        queue.close();
        let err = queue
            .enqueue(&NodeId::from("node-a"), &AgentId::from("r1"), &message())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::QueueUnavailable(_)));
    }
}
