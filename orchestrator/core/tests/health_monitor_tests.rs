// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for heartbeat expiry, drain completion and purge.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::application::agent_manager::{AgentManager, RegistrationRequest};
use agentmesh_core::domain::agent::{AgentId, AgentKind, AgentState, NodeId};
use agentmesh_core::domain::events::{AgentLifecycleEvent, EvictionReason};
use agentmesh_core::domain::mesh_config::HealthConfig;
use agentmesh_core::domain::registry::{AgentRegistry, RegistryError};
use agentmesh_core::infrastructure::event_bus::{EventBus, MeshEvent};
use agentmesh_core::infrastructure::registry::InMemoryAgentRegistry;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

fn config() -> HealthConfig {
    HealthConfig {
        check_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(10),
        retention_window: Duration::from_secs(60),
    }
}

fn setup() -> (Arc<InMemoryAgentRegistry>, AgentManager, EventBus) {
    let bus = EventBus::new(256);
    let registry = Arc::new(InMemoryAgentRegistry::new(bus.clone()));
    let manager = AgentManager::new(registry.clone(), bus.clone(), config());
    (registry, manager, bus)
}

fn register(manager: &AgentManager, id: &str) {
    manager
        .register(RegistrationRequest::new(AgentKind::Knowledge, vec![], NodeId::from("node-a")).with_agent_id(id))
        .unwrap();
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[test]
fn test_silent_agent_goes_offline_then_is_purged() {
    let (registry, manager, bus) = setup();
    let mut events = bus.subscribe();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    let monitor = manager.health_monitor();
    let t0 = Utc::now();

    // Inside the heartbeat timeout
    assert!(monitor.sweep_at(t0 + secs(5)).is_empty());

    let report = monitor.sweep_at(t0 + secs(11));
    assert_eq!(report.expired, vec![id.clone()]);
    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Offline);

    // Still inside the retention window
    assert!(monitor.sweep_at(t0 + secs(60)).purged.is_empty());
    assert!(registry.lookup(&id).is_ok());

    let report = monitor.sweep_at(t0 + secs(11 + 61));
    assert_eq!(report.purged, vec![id.clone()]);
    assert!(matches!(registry.lookup(&id), Err(RegistryError::NotFound(_))));

    let mut reasons = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MeshEvent::AgentLifecycle(AgentLifecycleEvent::AgentEvicted { reason, .. }) = event {
            reasons.push(reason);
        }
    }
    assert_eq!(reasons, vec![EvictionReason::HeartbeatExpired]);
}

#[test]
fn test_offline_agent_does_not_come_back_on_heartbeat() {
    let (registry, manager, _bus) = setup();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    let t0 = Utc::now();

    manager.health_monitor().sweep_at(t0 + secs(11));
    manager.heartbeat(&id, Some(t0 + secs(12))).unwrap();
    manager.health_monitor().sweep_at(t0 + secs(13));

    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Offline);

    // Only a new registration brings the id back
    register(&manager, "k1");
    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Active);
}

#[test]
fn test_heartbeat_keeps_agent_alive() {
    let (registry, manager, _bus) = setup();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    let t0 = Utc::now();

    manager.heartbeat(&id, Some(t0 + secs(8))).unwrap();
    assert!(manager.health_monitor().sweep_at(t0 + secs(15)).is_empty());
    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Active);
}

#[test]
fn test_draining_agent_that_stops_heartbeating_expires() {
    let (registry, manager, _bus) = setup();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    registry.adjust_inflight(&id, 1).unwrap();
    manager.begin_drain(&id).unwrap();

    let report = manager.health_monitor().sweep_at(Utc::now() + secs(30));
    assert_eq!(report.expired, vec![id.clone()]);
    assert!(report.drained.is_empty());
}

#[test]
fn test_idle_draining_agent_completes_drain() {
    let (registry, manager, _bus) = setup();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    manager.begin_drain(&id).unwrap();

    let report = manager.health_monitor().sweep_at(Utc::now());
    assert_eq!(report.drained, vec![id.clone()]);
    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Offline);
}

#[test]
fn test_reregistered_instance_is_not_purged_by_stale_sweep() {
    let (registry, manager, _bus) = setup();
    register(&manager, "k1");
    let id = AgentId::from("k1");
    let t0 = Utc::now();

    manager.health_monitor().sweep_at(t0 + secs(11));
    register(&manager, "k1");

    // The old instance's retention elapsed, but the record now belongs to a live instance
    let report = manager.health_monitor().sweep_at(t0 + secs(5));
    assert!(report.purged.is_empty());
    assert_eq!(registry.lookup(&id).unwrap().state, AgentState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_background_monitor_stops_on_cancel() {
    let (_registry, manager, _bus) = setup();
    register(&manager, "k1");
    let cancel = CancellationToken::new();

    let handle = manager.spawn_health_monitor(cancel.clone());
    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();
    handle.await.unwrap();

    // Wall-clock time did not pass, so the agent is still alive
    assert_eq!(
        manager.get(&AgentId::from("k1")).unwrap().state,
        AgentState::Active
    );
}
