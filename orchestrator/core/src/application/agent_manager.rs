// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Manager
//!
//! Owns the lifecycle state machine of agent records. Together with the
//! [`HealthMonitor`] it is the only writer of `AgentDescriptor::state`.
//!
//! Registration is two-phase: the request is validated, the record is inserted
//! as `Registering` (so it is visible for duplicate detection), then promoted
//! to `Active`. A request that fails validation never touches the registry, so
//! a forced registration cannot displace a live record and then fail.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::health_monitor::HealthMonitor;
use crate::domain::agent::{AgentDescriptor, AgentId, AgentKind, AgentState, Capability, NodeId};
use crate::domain::events::AgentLifecycleEvent;
use crate::domain::mesh_config::HealthConfig;
use crate::domain::registry::{AgentRegistry, HeartbeatOutcome, RegistryError, Transition};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::metrics;

/// Input to [`AgentManager::register`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Generated from the kind when absent.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: AgentKind,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub node_id: NodeId,
    #[serde(default)]
    pub capacity_hint: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Evict a live record holding the same id.
    #[serde(default)]
    pub force: bool,
}

impl RegistrationRequest {
    pub fn new(kind: AgentKind, capabilities: impl IntoIterator<Item = Capability>, node_id: NodeId) -> Self {
        Self {
            agent_id: None,
            name: None,
            kind,
            capabilities: capabilities.into_iter().collect(),
            node_id,
            capacity_hint: None,
            metadata: HashMap::new(),
            force: false,
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_capacity_hint(mut self, capacity: u32) -> Self {
        self.capacity_hint = Some(capacity);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

pub struct AgentManager {
    registry: Arc<dyn AgentRegistry>,
    event_bus: EventBus,
    health_monitor: Arc<HealthMonitor>,
}

impl AgentManager {
    pub fn new(registry: Arc<dyn AgentRegistry>, event_bus: EventBus, health: HealthConfig) -> Self {
        let health_monitor = Arc::new(HealthMonitor::new(registry.clone(), event_bus.clone(), health));
        Self {
            registry,
            event_bus,
            health_monitor,
        }
    }

    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health_monitor
    }

    pub fn register(&self, request: RegistrationRequest) -> Result<AgentDescriptor, RegistryError> {
        let agent_id = request
            .agent_id
            .unwrap_or_else(|| AgentId::generate(request.kind));

        let mut descriptor = AgentDescriptor::new(agent_id.clone(), request.kind, request.capabilities, request.node_id)
            .with_capacity_hint(request.capacity_hint)
            .with_metadata(request.metadata);
        if let Some(name) = request.name.filter(|n| !n.trim().is_empty()) {
            descriptor = descriptor.with_name(name);
        }

        if let Err(reason) = validate(&descriptor) {
            warn!(agent_id = %agent_id, reason = %reason, "Registration rejected");
            return Err(RegistryError::InvalidRegistration(reason));
        }

        let outcome = self.registry.register(descriptor, request.force)?;
        let instance = outcome.descriptor.instance;

        let now = Utc::now();
        let activated = self.registry.transition_if(&agent_id, AgentState::Active, now, &|current| {
            current.instance == instance && current.state == AgentState::Registering
        })?;

        match activated {
            Transition::Applied { descriptor, .. } => {
                info!(
                    agent_id = %agent_id,
                    kind = %descriptor.kind,
                    node_id = %descriptor.node_id,
                    capabilities = ?descriptor.capabilities,
                    "Agent active"
                );
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentActivated {
                    agent_id,
                    activated_at: now,
                });
                metrics::record_state_counts(&self.registry.counts());
                Ok(descriptor)
            }
            Transition::Skipped(current) => Err(RegistryError::DuplicateActiveRegistration {
                agent_id,
                state: current.state,
            }),
        }
    }

    /// Move an Active agent to Draining. Draining an already draining agent is a no-op.
    pub fn begin_drain(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError> {
        let now = Utc::now();
        match self
            .registry
            .transition_if(agent_id, AgentState::Draining, now, &|current| current.state != AgentState::Draining)?
        {
            Transition::Applied { descriptor, .. } => {
                info!(agent_id = %agent_id, inflight = descriptor.inflight_count, "Agent draining");
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentDraining {
                    agent_id: agent_id.clone(),
                    inflight_count: descriptor.inflight_count,
                    started_at: now,
                });
                Ok(descriptor)
            }
            Transition::Skipped(descriptor) => Ok(descriptor),
        }
    }

    pub fn unregister(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError> {
        let descriptor = self.registry.unregister(agent_id)?;
        metrics::record_state_counts(&self.registry.counts());
        Ok(descriptor)
    }

    /// Administrative removal: drain gracefully, or take offline at once.
    pub fn remove(&self, agent_id: &AgentId, drain: bool) -> Result<AgentDescriptor, RegistryError> {
        if drain {
            self.begin_drain(agent_id)
        } else {
            self.unregister(agent_id)
        }
    }

    /// Record a liveness signal. `at` defaults to now.
    pub fn heartbeat(&self, agent_id: &AgentId, at: Option<DateTime<Utc>>) -> Result<HeartbeatOutcome, RegistryError> {
        let outcome = self.registry.touch_heartbeat(agent_id, at.unwrap_or_else(Utc::now))?;
        if outcome == HeartbeatOutcome::Stale {
            warn!(agent_id = %agent_id, "Out-of-order heartbeat discarded");
        }
        Ok(outcome)
    }

    pub fn get(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError> {
        self.registry.lookup(agent_id)
    }

    pub fn list(&self) -> Vec<AgentDescriptor> {
        self.registry.list()
    }

    /// Run the health monitor in the background until `cancel` fires.
    pub fn spawn_health_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.health_monitor.clone().run(cancel))
    }
}

fn validate(descriptor: &AgentDescriptor) -> Result<(), String> {
    if descriptor.capabilities.is_empty() {
        return Err(format!(
            "agent {} advertises no capabilities and its kind provides none",
            descriptor.agent_id
        ));
    }
    if descriptor.capacity_hint == Some(0) {
        return Err("capacity_hint must be at least 1 when set".to_string());
    }
    Ok(())
}
