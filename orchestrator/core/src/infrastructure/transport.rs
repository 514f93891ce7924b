// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Connection Hub - per-agent duplex channels
//
// Each connected agent gets a pair of bounded mpsc channels. Inbound frames
// are drained by one dedicated task per connection, so a slow handler only
// stalls its own agent: the agent's `send` waits for buffer space while the
// rest of the mesh keeps running. Outbound frames never wait; a full buffer
// surfaces as `Backpressure` to the caller.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentId;
use crate::domain::transport::{Frame, FrameHandler, Transport, TransportError};

/// Agent side of a connection.
pub struct AgentConnection {
    agent_id: AgentId,
    to_mesh: mpsc::Sender<Frame>,
    from_mesh: mpsc::Receiver<Frame>,
}

impl AgentConnection {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Push a frame to the mesh, waiting while the inbound buffer is full.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.to_mesh
            .send(frame)
            .await
            .map_err(|_| TransportError::NotConnected(self.agent_id.clone()))
    }

    /// Next frame from the mesh; `None` once the hub dropped the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_mesh.recv().await
    }
}

struct ConnectionSlot {
    to_agent: mpsc::Sender<Frame>,
    from_agent: Mutex<Option<mpsc::Receiver<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ConnectionSlot {
    fn is_open(&self) -> bool {
        !self.to_agent.is_closed()
    }
}

pub struct ConnectionHub {
    buffer: usize,
    connections: DashMap<AgentId, ConnectionSlot>,
    shutdown: CancellationToken,
}

impl ConnectionHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a connection for `agent_id`. A previous connection whose agent
    /// side has gone away is replaced.
    pub fn connect(&self, agent_id: AgentId) -> Result<AgentConnection, TransportError> {
        if let Some(existing) = self.connections.get(&agent_id) {
            if existing.is_open() {
                return Err(TransportError::AlreadyConnected(agent_id));
            }
        }
        self.disconnect(&agent_id);

        let (to_mesh, from_agent) = mpsc::channel(self.buffer);
        let (to_agent, from_mesh) = mpsc::channel(self.buffer);

        self.connections.insert(
            agent_id.clone(),
            ConnectionSlot {
                to_agent,
                from_agent: Mutex::new(Some(from_agent)),
                reader: Mutex::new(None),
                cancel: self.shutdown.child_token(),
            },
        );
        info!(agent_id = %agent_id, buffer = self.buffer, "Agent connected");

        Ok(AgentConnection {
            agent_id,
            to_mesh,
            from_mesh,
        })
    }

    /// Drop the connection and stop its reader task.
    pub fn disconnect(&self, agent_id: &AgentId) -> bool {
        match self.connections.remove(agent_id) {
            Some((_, slot)) => {
                slot.cancel.cancel();
                debug!(agent_id = %agent_id, "Agent connection closed");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.connections
            .get(agent_id)
            .map(|slot| slot.is_open())
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|slot| slot.is_open()).count()
    }

    /// Stop every reader task and drop all connections.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let readers: Vec<JoinHandle<()>> = self
            .connections
            .iter()
            .filter_map(|slot| slot.reader.lock().take())
            .collect();
        self.connections.clear();
        for reader in readers {
            let _ = reader.await;
        }
        info!("Connection hub shut down");
    }
}

impl Transport for ConnectionHub {
    fn send(&self, agent_id: &AgentId, frame: Frame) -> Result<(), TransportError> {
        let slot = self
            .connections
            .get(agent_id)
            .ok_or_else(|| TransportError::NotConnected(agent_id.clone()))?;

        slot.to_agent.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(agent_id = %agent_id, "Outbound buffer full");
                TransportError::Backpressure(agent_id.clone())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected(agent_id.clone()),
        })
    }

    fn on_receive(&self, agent_id: &AgentId, handler: Arc<dyn FrameHandler>) -> Result<(), TransportError> {
        let slot = self
            .connections
            .get(agent_id)
            .ok_or_else(|| TransportError::NotConnected(agent_id.clone()))?;

        let mut inbound = slot
            .from_agent
            .lock()
            .take()
            .ok_or_else(|| TransportError::AlreadyConnected(agent_id.clone()))?;

        let replies = slot.to_agent.clone();
        let cancel = slot.cancel.clone();
        let agent_id = agent_id.clone();

        let reader = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                if let Some(reply) = handler.on_frame(&agent_id, frame).await {
                    if replies.try_send(reply).is_err() {
                        warn!(agent_id = %agent_id, "Dropping reply frame, outbound buffer unavailable");
                    }
                }
            }
            debug!(agent_id = %agent_id, "Connection reader stopped");
        });

        *slot.reader.lock() = Some(reader);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for CountingHandler {
        async fn on_frame(&self, _agent_id: &AgentId, frame: Frame) -> Option<Frame> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match frame {
                Frame::Ack { .. } => Some(Frame::Error {
                    message: "unexpected ack".to_string(),
                }),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handler_and_replies_come_back() {
        let hub = ConnectionHub::new(4);
        let id = AgentId::from("r1");
        let mut conn = hub.connect(id.clone()).unwrap();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        hub.on_receive(&id, handler.clone()).unwrap();

        conn.send(Frame::Heartbeat { at: None }).await.unwrap();
        conn.send(Frame::Ack {
            message_id: MessageId::new(),
        })
        .await
        .unwrap();

        match conn.recv().await {
            Some(Frame::Error { message }) => assert_eq!(message, "unexpected ack"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_reports_backpressure_and_not_connected() {
        let hub = ConnectionHub::new(1);
        let id = AgentId::from("r1");
        let _conn = hub.connect(id.clone()).unwrap();

        hub.send(&id, Frame::Heartbeat { at: None }).unwrap();
        assert_eq!(
            hub.send(&id, Frame::Heartbeat { at: None }),
            Err(TransportError::Backpressure(id.clone()))
        );
        assert_eq!(
            hub.send(&AgentId::from("ghost"), Frame::Heartbeat { at: None }),
            Err(TransportError::NotConnected(AgentId::from("ghost")))
        );
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected_until_agent_side_drops() {
        let hub = ConnectionHub::new(2);
        let id = AgentId::from("r1");
        let conn = hub.connect(id.clone()).unwrap();

        assert!(matches!(hub.connect(id.clone()), Err(TransportError::AlreadyConnected(_))));
        assert!(hub.is_connected(&id));

        drop(conn);
        assert!(!hub.is_connected(&id));
        assert!(hub.connect(id.clone()).is_ok());
        assert_eq!(hub.connected_count(), 1);
    }
}
