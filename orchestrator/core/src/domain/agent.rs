// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Descriptor Aggregate
//!
//! Identity and routing metadata for one registered agent instance, plus the
//! lifecycle state machine that governs when an instance is eligible for
//! routing.
//!
//! ```text
//! Registering ──► Active ──► Draining ──► Offline ──► (purged)
//!      │             │                       ▲
//!      └─────────────┴───────────────────────┘
//! ```
//!
//! Behaviour (LLM reasoning, knowledge retrieval) lives inside the agents
//! themselves; the mesh only knows an instance by its [`AgentKind`] and the
//! capability tags it advertises.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Globally unique agent identifier, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id prefixed with the agent kind, e.g. `researcher-1f0c2a9e`.
    pub fn generate(kind: AgentKind) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", kind.as_str(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the host process running an agent instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Capability tag describing a class of work (e.g. `research`).
///
/// Tags are trimmed and lower-cased so `"Research "` and `"research"` match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

/// Behavioural family of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Researcher,
    Analyst,
    Coordinator,
    Knowledge,
    #[default]
    Generic,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Researcher => "researcher",
            AgentKind::Analyst => "analyst",
            AgentKind::Coordinator => "coordinator",
            AgentKind::Knowledge => "knowledge",
            AgentKind::Generic => "generic",
        }
    }

    /// Capabilities every instance of this kind advertises implicitly.
    pub fn default_capabilities(&self) -> Vec<Capability> {
        match self {
            AgentKind::Researcher => vec![Capability::new("research")],
            AgentKind::Analyst => vec![Capability::new("analysis")],
            AgentKind::Coordinator => vec![Capability::new("coordination")],
            AgentKind::Knowledge => vec![Capability::new("knowledge")],
            AgentKind::Generic => vec![],
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "researcher" => Ok(AgentKind::Researcher),
            "analyst" => Ok(AgentKind::Analyst),
            "coordinator" => Ok(AgentKind::Coordinator),
            "knowledge" => Ok(AgentKind::Knowledge),
            "generic" => Ok(AgentKind::Generic),
            other => Err(format!("unknown agent kind '{}'", other)),
        }
    }
}

/// Lifecycle state of an agent instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Visible for duplicate detection, not yet routable.
    Registering,
    /// Eligible for capability routing and direct addressing.
    Active,
    /// Finishing in-flight work; excluded from new capability routing.
    Draining,
    /// Unreachable. Retained until the retention window elapses.
    Offline,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Registering => "registering",
            AgentState::Active => "active",
            AgentState::Draining => "draining",
            AgentState::Offline => "offline",
        }
    }

    /// Whether a record in this state blocks a non-forced registration of the same id.
    pub fn holds_identity(&self) -> bool {
        !matches!(self, AgentState::Offline)
    }

    /// Legal edges of the lifecycle state machine.
    ///
    /// Offline is terminal: a record only leaves it by being replaced through a
    /// new registration or by being purged.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Registering, Active)
                | (Registering, Offline)
                | (Active, Draining)
                | (Active, Offline)
                | (Draining, Offline)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "registering" => Ok(AgentState::Registering),
            "active" => Ok(AgentState::Active),
            "draining" => Ok(AgentState::Draining),
            "offline" => Ok(AgentState::Offline),
            other => Err(format!("unknown agent state '{}'", other)),
        }
    }
}

/// Registry record for one agent instance.
///
/// # Invariants
///
/// - `agent_id` and `registered_at` never change for the lifetime of the record.
/// - `instance` is unique per registration, so a forced re-registration under
///   the same id is distinguishable from the instance it replaced.
/// - `inflight_count` never goes below zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub capabilities: BTreeSet<Capability>,
    pub node_id: NodeId,
    pub state: AgentState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub inflight_count: u32,
    /// Maximum concurrent in-flight messages; `None` means unbounded.
    pub capacity_hint: Option<u32>,
    pub registered_at: DateTime<Utc>,
    /// Registration sequence number assigned by the registry.
    pub instance: u64,
    /// When the record entered `Offline`; starts the retention window.
    pub offline_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AgentDescriptor {
    /// Create a record in the `Registering` state.
    pub fn new(
        agent_id: AgentId,
        kind: AgentKind,
        capabilities: impl IntoIterator<Item = Capability>,
        node_id: NodeId,
    ) -> Self {
        let now = Utc::now();
        let capabilities = kind
            .default_capabilities()
            .into_iter()
            .chain(capabilities)
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            name: agent_id.to_string(),
            agent_id,
            kind,
            capabilities,
            node_id,
            state: AgentState::Registering,
            last_heartbeat_at: now,
            inflight_count: 0,
            capacity_hint: None,
            registered_at: now,
            instance: 0,
            offline_since: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity_hint(mut self, capacity: Option<u32>) -> Self {
        self.capacity_hint = capacity;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.registered_at = at;
        self.last_heartbeat_at = at;
        self
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_routable(&self) -> bool {
        self.state == AgentState::Active
    }

    /// True once every reserved slot is taken. Unbounded instances are never saturated.
    pub fn is_saturated(&self) -> bool {
        self.capacity_hint
            .map(|cap| self.inflight_count >= cap)
            .unwrap_or(false)
    }

    /// Apply a lifecycle transition, stamping `offline_since` on entry to Offline.
    pub fn transition(&mut self, next: AgentState, at: DateTime<Utc>) -> Result<AgentState, (AgentState, AgentState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        let previous = self.state;
        self.state = next;
        if next == AgentState::Offline {
            self.offline_since = Some(at);
        }
        Ok(previous)
    }

    /// Whether no heartbeat has been seen for longer than `timeout` at `now`.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_normalization() {
        assert_eq!(Capability::new("  Research "), Capability::new("research"));
        assert_eq!(Capability::from("ANALYSIS").as_str(), "analysis");
    }

    #[test]
    fn test_kind_defaults_merge_with_explicit_capabilities() {
        let descriptor = AgentDescriptor::new(
            AgentId::from("r1"),
            AgentKind::Researcher,
            vec![Capability::new("web"), Capability::new("research")],
            NodeId::from("node-a"),
        );

        assert_eq!(descriptor.capabilities.len(), 2);
        assert!(descriptor.has_capability(&Capability::new("research")));
        assert!(descriptor.has_capability(&Capability::new("web")));
        assert_eq!(descriptor.state, AgentState::Registering);
        assert_eq!(descriptor.name, "r1");
    }

    #[test]
    fn test_generated_id_carries_kind_prefix() {
        let id = AgentId::generate(AgentKind::Analyst);
        assert!(id.as_str().starts_with("analyst-"));
        assert_eq!(id.as_str().len(), "analyst-".len() + 8);
    }

    #[test]
    fn test_lifecycle_edges() {
        use AgentState::*;
        assert!(Registering.can_transition_to(Active));
        assert!(Active.can_transition_to(Draining));
        assert!(Active.can_transition_to(Offline));
        assert!(Draining.can_transition_to(Offline));

        assert!(!Offline.can_transition_to(Active));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Active.can_transition_to(Registering));
    }

    #[test]
    fn test_offline_transition_stamps_retention_start() {
        let mut descriptor = AgentDescriptor::new(
            AgentId::from("a1"),
            AgentKind::Generic,
            vec![Capability::new("analysis")],
            NodeId::from("node-a"),
        );
        let at = Utc::now();
        descriptor.transition(AgentState::Active, at).unwrap();
        assert!(descriptor.offline_since.is_none());

        descriptor.transition(AgentState::Offline, at).unwrap();
        assert_eq!(descriptor.offline_since, Some(at));
        assert_eq!(
            descriptor.transition(AgentState::Active, at),
            Err((AgentState::Offline, AgentState::Active))
        );
    }

    #[test]
    fn test_saturation() {
        let mut descriptor = AgentDescriptor::new(
            AgentId::from("a1"),
            AgentKind::Analyst,
            vec![],
            NodeId::from("node-a"),
        )
        .with_capacity_hint(Some(2));
        assert!(!descriptor.is_saturated());
        descriptor.inflight_count = 2;
        assert!(descriptor.is_saturated());

        descriptor.capacity_hint = None;
        descriptor.inflight_count = 10_000;
        assert!(!descriptor.is_saturated());
    }

    #[test]
    fn test_heartbeat_expiry_is_strict() {
        let at = Utc::now();
        let descriptor = AgentDescriptor::new(
            AgentId::from("a1"),
            AgentKind::Analyst,
            vec![],
            NodeId::from("node-a"),
        )
        .with_registered_at(at);
        let timeout = chrono::Duration::seconds(30);

        assert!(!descriptor.heartbeat_expired(at + timeout, timeout));
        assert!(descriptor.heartbeat_expired(at + timeout + chrono::Duration::seconds(1), timeout));
    }
}
