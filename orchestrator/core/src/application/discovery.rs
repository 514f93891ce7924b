// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Discovery Service - read-only queries over the agent registry

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentDescriptor, AgentKind, AgentState, Capability, NodeId};
use crate::domain::registry::AgentRegistry;

/// Filters combined with AND. An empty query lists every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
}

impl DiscoveryQuery {
    pub fn capability(capability: impl Into<Capability>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    fn matches(&self, descriptor: &AgentDescriptor) -> bool {
        self.capability.as_ref().map_or(true, |c| descriptor.has_capability(c))
            && self.kind.map_or(true, |k| descriptor.kind == k)
            && self.node_id.as_ref().map_or(true, |n| &descriptor.node_id == n)
            && self.state.map_or(true, |s| descriptor.state == s)
    }
}

pub struct DiscoveryService {
    registry: Arc<dyn AgentRegistry>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<dyn AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Records matching `query`, in registration order.
    pub fn find(&self, query: &DiscoveryQuery) -> Vec<AgentDescriptor> {
        let records = match (&query.capability, query.state) {
            // The capability index only holds Active records
            (Some(capability), Some(AgentState::Active)) => self.registry.find_by_capability(capability),
            _ => self.registry.list(),
        };
        records.into_iter().filter(|d| query.matches(d)).collect()
    }

    /// Number of Active agents per advertised capability.
    pub fn capability_catalog(&self) -> BTreeMap<Capability, usize> {
        let mut catalog = BTreeMap::new();
        for descriptor in self.registry.list().into_iter().filter(AgentDescriptor::is_routable) {
            for capability in descriptor.capabilities {
                *catalog.entry(capability).or_insert(0) += 1;
            }
        }
        catalog
    }
}
