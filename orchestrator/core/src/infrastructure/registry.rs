// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory [`AgentRegistry`] backed by a sharded concurrent map.
//!
//! Each record sits behind its own `DashMap` shard lock, so every
//! operation is atomic per record without a global lock. A secondary
//! capability index keeps `find_by_capability` from scanning the whole map;
//! entries are keyed by `(instance, agent_id)` so stale entries left by a
//! replaced or purged record are filtered out on read.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentDescriptor, AgentId, AgentState, Capability};
use crate::domain::events::{AgentLifecycleEvent, EvictionReason};
use crate::domain::registry::{
    AgentRegistry, HeartbeatOutcome, InflightAdjustment, RegistrationOutcome, RegistryError, ReserveOutcome,
    StateCounts, Transition,
};
use crate::domain::routing::Reservation;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::metrics;

pub struct InMemoryAgentRegistry {
    records: DashMap<AgentId, AgentDescriptor>,
    capability_index: RwLock<HashMap<Capability, BTreeSet<(u64, AgentId)>>>,
    next_instance: AtomicU64,
    event_bus: EventBus,
}

impl InMemoryAgentRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            capability_index: RwLock::new(HashMap::new()),
            next_instance: AtomicU64::new(0),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    fn index_insert(&self, descriptor: &AgentDescriptor) {
        let mut index = self.capability_index.write();
        for capability in &descriptor.capabilities {
            index
                .entry(capability.clone())
                .or_default()
                .insert((descriptor.instance, descriptor.agent_id.clone()));
        }
    }

    fn index_remove(&self, descriptor: &AgentDescriptor) {
        let mut index = self.capability_index.write();
        let key = (descriptor.instance, descriptor.agent_id.clone());
        for capability in &descriptor.capabilities {
            if let Some(entries) = index.get_mut(capability) {
                entries.remove(&key);
                if entries.is_empty() {
                    index.remove(capability);
                }
            }
        }
    }

    /// Apply a signed delta to a record's counter, clamping at zero.
    fn apply_delta(&self, descriptor: &mut AgentDescriptor, delta: i64) -> InflightAdjustment {
        let target = descriptor.inflight_count as i64 + delta;
        let underflow = target < 0;
        descriptor.inflight_count = target.clamp(0, u32::MAX as i64) as u32;

        if underflow {
            warn!(
                agent_id = %descriptor.agent_id,
                delta,
                "In-flight counter underflow, clamped at zero"
            );
            ::metrics::counter!(metrics::INFLIGHT_UNDERFLOW_TOTAL).increment(1);
            self.event_bus.publish_agent_event(AgentLifecycleEvent::CounterUnderflow {
                agent_id: descriptor.agent_id.clone(),
                attempted_delta: delta,
                observed_at: Utc::now(),
            });
        }

        InflightAdjustment {
            inflight_count: descriptor.inflight_count,
            underflow,
        }
    }
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new(EventBus::with_default_capacity())
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn register(&self, mut descriptor: AgentDescriptor, force: bool) -> Result<RegistrationOutcome, RegistryError> {
        if descriptor.agent_id.as_str().trim().is_empty() {
            return Err(RegistryError::InvalidRegistration("agent_id cannot be empty".to_string()));
        }
        if descriptor.node_id.is_empty() {
            return Err(RegistryError::InvalidRegistration("node_id cannot be empty".to_string()));
        }

        descriptor.state = AgentState::Registering;
        descriptor.inflight_count = 0;
        descriptor.offline_since = None;

        let replaced = match self.records.entry(descriptor.agent_id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.state.holds_identity() && !force {
                    return Err(RegistryError::DuplicateActiveRegistration {
                        agent_id: existing.agent_id.clone(),
                        state: existing.state,
                    });
                }
                descriptor.instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
                Some(entry.insert(descriptor.clone()))
            }
            Entry::Vacant(entry) => {
                descriptor.instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
                entry.insert(descriptor.clone());
                None
            }
        };

        if let Some(old) = &replaced {
            self.index_remove(old);
            if old.state.holds_identity() {
                warn!(
                    agent_id = %old.agent_id,
                    old_instance = old.instance,
                    new_instance = descriptor.instance,
                    "Forced registration replaced a live record"
                );
                ::metrics::counter!(metrics::AGENTS_EVICTED_TOTAL, "reason" => EvictionReason::Replaced.as_str()).increment(1);
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentEvicted {
                    agent_id: old.agent_id.clone(),
                    reason: EvictionReason::Replaced,
                    evicted_at: Utc::now(),
                });
            }
        }
        self.index_insert(&descriptor);

        info!(
            agent_id = %descriptor.agent_id,
            node_id = %descriptor.node_id,
            instance = descriptor.instance,
            "Agent record registered"
        );
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentRegistered {
            agent_id: descriptor.agent_id.clone(),
            node_id: descriptor.node_id.clone(),
            capabilities: descriptor.capabilities.iter().cloned().collect(),
            registered_at: descriptor.registered_at,
        });

        Ok(RegistrationOutcome { descriptor, replaced })
    }

    fn unregister(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError> {
        let mut record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))?;

        if record.state == AgentState::Offline {
            return Ok(record.value().clone());
        }

        let now = Utc::now();
        record
            .transition(AgentState::Offline, now)
            .map_err(|(from, to)| RegistryError::InvalidTransition {
                agent_id: agent_id.clone(),
                from,
                to,
            })?;
        let snapshot = record.value().clone();
        drop(record);

        info!(agent_id = %agent_id, "Agent unregistered");
        ::metrics::counter!(metrics::AGENTS_EVICTED_TOTAL, "reason" => EvictionReason::Unregistered.as_str()).increment(1);
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentEvicted {
            agent_id: agent_id.clone(),
            reason: EvictionReason::Unregistered,
            evicted_at: now,
        });

        Ok(snapshot)
    }

    fn lookup(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError> {
        self.records
            .get(agent_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))
    }

    fn find_by_capability(&self, capability: &Capability) -> Vec<AgentDescriptor> {
        let keys: Vec<(u64, AgentId)> = match self.capability_index.read().get(capability) {
            Some(entries) => entries.iter().cloned().collect(),
            None => return Vec::new(),
        };

        keys.into_iter()
            .filter_map(|(instance, agent_id)| {
                self.records
                    .get(&agent_id)
                    .filter(|r| r.instance == instance && r.state == AgentState::Active)
                    .map(|r| r.value().clone())
            })
            .collect()
    }

    fn list(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|d| d.instance);
        all
    }

    fn touch_heartbeat(&self, agent_id: &AgentId, at: DateTime<Utc>) -> Result<HeartbeatOutcome, RegistryError> {
        let mut record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))?;

        if at < record.last_heartbeat_at {
            debug!(agent_id = %agent_id, "Discarding stale heartbeat");
            return Ok(HeartbeatOutcome::Stale);
        }
        record.last_heartbeat_at = at;
        Ok(HeartbeatOutcome::Applied)
    }

    fn adjust_inflight(&self, agent_id: &AgentId, delta: i64) -> Result<InflightAdjustment, RegistryError> {
        let mut record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))?;
        Ok(self.apply_delta(&mut record, delta))
    }

    fn try_reserve(&self, agent_id: &AgentId, enforce_capacity: bool) -> Result<ReserveOutcome, RegistryError> {
        let mut record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))?;

        if record.state != AgentState::Active {
            return Ok(ReserveOutcome::NotEligible(record.state));
        }
        if enforce_capacity && record.is_saturated() {
            return Ok(ReserveOutcome::AtCapacity);
        }

        record.inflight_count = record.inflight_count.saturating_add(1);
        Ok(ReserveOutcome::Reserved(Reservation {
            agent_id: record.agent_id.clone(),
            instance: record.instance,
        }))
    }

    fn release(&self, reservation: &Reservation) -> Result<Option<InflightAdjustment>, RegistryError> {
        let Some(mut record) = self.records.get_mut(&reservation.agent_id) else {
            debug!(agent_id = %reservation.agent_id, "Release for a purged record ignored");
            return Ok(None);
        };

        if record.instance != reservation.instance {
            debug!(
                agent_id = %reservation.agent_id,
                reserved_instance = reservation.instance,
                current_instance = record.instance,
                "Release for a replaced instance ignored"
            );
            return Ok(None);
        }
        Ok(Some(self.apply_delta(&mut record, -1)))
    }

    fn transition_if(
        &self,
        agent_id: &AgentId,
        to: AgentState,
        at: DateTime<Utc>,
        condition: &dyn Fn(&AgentDescriptor) -> bool,
    ) -> Result<Transition, RegistryError> {
        let mut record = self
            .records
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.clone()))?;

        if !condition(&*record) {
            return Ok(Transition::Skipped(record.value().clone()));
        }

        let from = record
            .transition(to, at)
            .map_err(|(from, to)| RegistryError::InvalidTransition {
                agent_id: agent_id.clone(),
                from,
                to,
            })?;

        debug!(agent_id = %agent_id, from = %from, to = %to, "Agent state transition");
        Ok(Transition::Applied {
            from,
            descriptor: record.value().clone(),
        })
    }

    fn purge_if(
        &self,
        agent_id: &AgentId,
        condition: &dyn Fn(&AgentDescriptor) -> bool,
    ) -> Result<Option<AgentDescriptor>, RegistryError> {
        if !self.records.contains_key(agent_id) {
            return Err(RegistryError::NotFound(agent_id.clone()));
        }

        let Some((_, removed)) = self.records.remove_if(agent_id, |_, record| condition(record)) else {
            return Ok(None);
        };

        self.index_remove(&removed);
        info!(agent_id = %agent_id, instance = removed.instance, "Agent record purged");
        self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentPurged {
            agent_id: agent_id.clone(),
            purged_at: Utc::now(),
        });
        Ok(Some(removed))
    }

    fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in self.records.iter() {
            counts.record(record.state);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{AgentKind, NodeId};
    use crate::infrastructure::event_bus::MeshEvent;

    fn descriptor(id: &str, caps: &[&str]) -> AgentDescriptor {
        AgentDescriptor::new(
            AgentId::from(id),
            AgentKind::Generic,
            caps.iter().map(|c| Capability::new(*c)),
            NodeId::from("node-a"),
        )
    }

    fn activate(registry: &InMemoryAgentRegistry, id: &str) {
        registry
            .transition_if(&AgentId::from(id), AgentState::Active, Utc::now(), &|_| true)
            .unwrap();
    }

    #[test]
    fn test_register_assigns_increasing_instances() {
        let registry = InMemoryAgentRegistry::default();
        let a = registry.register(descriptor("a", &["x"]), false).unwrap();
        let b = registry.register(descriptor("b", &["x"]), false).unwrap();
        assert!(b.descriptor.instance > a.descriptor.instance);
        assert_eq!(a.descriptor.state, AgentState::Registering);
    }

    #[test]
    fn test_duplicate_registration_rejected_unless_forced() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &["x"]), false).unwrap();

        let err = registry.register(descriptor("a", &["x"]), false).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateActiveRegistration { .. }));

        let outcome = registry.register(descriptor("a", &["y"]), true).unwrap();
        assert!(outcome.replaced.is_some());
        assert!(registry.lookup(&AgentId::from("a")).unwrap().has_capability(&Capability::new("y")));
    }

    #[test]
    fn test_offline_record_is_replaced_without_force() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &["x"]), false).unwrap();
        registry.unregister(&AgentId::from("a")).unwrap();

        let outcome = registry.register(descriptor("a", &["x"]), false).unwrap();
        assert_eq!(outcome.replaced.unwrap().state, AgentState::Offline);
    }

    #[test]
    fn test_find_by_capability_returns_active_only_in_registration_order() {
        let registry = InMemoryAgentRegistry::default();
        for id in ["c", "a", "b"] {
            registry.register(descriptor(id, &["research"]), false).unwrap();
        }
        activate(&registry, "c");
        activate(&registry, "b");

        let found: Vec<_> = registry
            .find_by_capability(&Capability::new("research"))
            .into_iter()
            .map(|d| d.agent_id.to_string())
            .collect();
        assert_eq!(found, vec!["c", "b"]);
        assert!(registry.find_by_capability(&Capability::new("unknown")).is_empty());
    }

    #[test]
    fn test_stale_heartbeat_is_discarded() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &[]), false).unwrap();
        let id = AgentId::from("a");
        let now = Utc::now() + chrono::Duration::seconds(10);

        assert_eq!(registry.touch_heartbeat(&id, now).unwrap(), HeartbeatOutcome::Applied);
        assert_eq!(
            registry
                .touch_heartbeat(&id, now - chrono::Duration::seconds(5))
                .unwrap(),
            HeartbeatOutcome::Stale
        );
        assert_eq!(registry.lookup(&id).unwrap().last_heartbeat_at, now);
    }

    #[tokio::test]
    async fn test_underflow_is_clamped_and_reported() {
        let registry = InMemoryAgentRegistry::default();
        let mut events = registry.event_bus().subscribe();
        registry.register(descriptor("a", &[]), false).unwrap();
        let _ = events.recv().await.unwrap();

        let adjustment = registry.adjust_inflight(&AgentId::from("a"), -1).unwrap();
        assert_eq!(adjustment.inflight_count, 0);
        assert!(adjustment.underflow);

        match events.recv().await.unwrap() {
            MeshEvent::AgentLifecycle(AgentLifecycleEvent::CounterUnderflow { attempted_delta, .. }) => {
                assert_eq!(attempted_delta, -1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_reserve_respects_capacity_and_state() {
        let registry = InMemoryAgentRegistry::default();
        registry
            .register(descriptor("a", &[]).with_capacity_hint(Some(1)), false)
            .unwrap();
        let id = AgentId::from("a");

        assert_eq!(
            registry.try_reserve(&id, true).unwrap(),
            ReserveOutcome::NotEligible(AgentState::Registering)
        );
        activate(&registry, "a");

        assert!(matches!(registry.try_reserve(&id, true).unwrap(), ReserveOutcome::Reserved(_)));
        assert_eq!(registry.try_reserve(&id, true).unwrap(), ReserveOutcome::AtCapacity);
        assert!(matches!(registry.try_reserve(&id, false).unwrap(), ReserveOutcome::Reserved(_)));
        assert_eq!(registry.lookup(&id).unwrap().inflight_count, 2);
    }

    #[test]
    fn test_release_against_replaced_instance_is_ignored() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &[]), false).unwrap();
        activate(&registry, "a");
        let id = AgentId::from("a");

        let ReserveOutcome::Reserved(reservation) = registry.try_reserve(&id, true).unwrap() else {
            panic!("expected reservation");
        };

        registry.register(descriptor("a", &[]), true).unwrap();
        activate(&registry, "a");
        let ReserveOutcome::Reserved(_) = registry.try_reserve(&id, true).unwrap() else {
            panic!("expected reservation");
        };

        assert_eq!(registry.release(&reservation).unwrap(), None);
        assert_eq!(registry.lookup(&id).unwrap().inflight_count, 1);
    }

    #[test]
    fn test_transition_if_skips_when_condition_fails() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &[]), false).unwrap();
        let id = AgentId::from("a");

        let outcome = registry
            .transition_if(&id, AgentState::Active, Utc::now(), &|d| d.inflight_count > 0)
            .unwrap();
        assert!(matches!(outcome, Transition::Skipped(_)));

        let err = registry
            .transition_if(&id, AgentState::Draining, Utc::now(), &|_| true)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_purge_removes_record_and_index_entries() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &["x"]), false).unwrap();
        let id = AgentId::from("a");

        assert!(registry.purge_if(&id, &|d| d.state == AgentState::Offline).unwrap().is_none());
        registry.unregister(&id).unwrap();
        assert!(registry.purge_if(&id, &|d| d.state == AgentState::Offline).unwrap().is_some());

        assert!(matches!(registry.lookup(&id), Err(RegistryError::NotFound(_))));
        assert!(registry.capability_index.read().is_empty());
        assert!(matches!(registry.purge_if(&id, &|_| true), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_counts() {
        let registry = InMemoryAgentRegistry::default();
        registry.register(descriptor("a", &[]), false).unwrap();
        registry.register(descriptor("b", &[]), false).unwrap();
        registry.register(descriptor("c", &[]), false).unwrap();
        activate(&registry, "a");
        activate(&registry, "b");
        registry.unregister(&AgentId::from("b")).unwrap();

        let counts = registry.counts();
        assert_eq!(counts.registering, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.offline, 1);
        assert_eq!(counts.total(), 3);
    }
}
