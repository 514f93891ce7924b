// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end tests of the coordinator wiring and the admin API client.

use std::time::Duration;

use agentmesh_cli::daemon::{check_daemon_running, DaemonStatus, MeshClient, MeshRuntime};
use agentmesh_core::application::agent_manager::RegistrationRequest;
use agentmesh_core::application::discovery::DiscoveryQuery;
use agentmesh_core::domain::agent::{AgentId, AgentKind, AgentState, Capability, NodeId};
use agentmesh_core::domain::delivery::DeliveryQueue;
use agentmesh_core::domain::mesh_config::MeshConfigManifest;
use agentmesh_core::domain::message::{DeliveryMode, Message, MessageKind};
use agentmesh_core::domain::transport::Frame;
use agentmesh_core::presentation::api::SendMessageRequest;
use agentmesh_core::presentation::app;
use serde_json::json;
use tokio::net::TcpListener;

fn test_config() -> MeshConfigManifest {
    let mut config = MeshConfigManifest::default();
    config.spec.health.check_interval = Duration::from_millis(50);
    config.spec.routing.shutdown_grace = Duration::from_millis(100);
    config
}

fn register(runtime: &MeshRuntime, id: &str, kind: AgentKind) {
    runtime
        .state
        .manager
        .register(RegistrationRequest::new(kind, vec![], NodeId::from("node-a")).with_agent_id(id))
        .unwrap();
}

#[tokio::test]
async fn test_connected_agent_routes_and_acknowledges_over_frames() {
    let runtime = MeshRuntime::start(&test_config());
    register(&runtime, "c1", AgentKind::Coordinator);
    register(&runtime, "a1", AgentKind::Analyst);

    let coordinator = runtime.connect_agent(AgentId::from("c1")).unwrap();
    let mut analyst = runtime.connect_agent(AgentId::from("a1")).unwrap();

    let message = Message::capability_routed(AgentId::from("c1"), Capability::new("analysis"), json!({"task": 1}));
    let message_id = message.message_id;
    coordinator.send(Frame::Send { message }).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), analyst.recv())
        .await
        .unwrap();
    let envelope = match frame {
        Some(Frame::Deliver { envelope }) => envelope,
        other => panic!("expected a pushed delivery, got {:?}", other),
    };
    assert_eq!(envelope.agent_id.as_str(), "a1");
    assert_eq!(envelope.message.message_id, message_id);
    assert_eq!(runtime.state.queue.buffered(&NodeId::from("node-a")), 0);

    analyst.send(Frame::Ack { message_id }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while runtime.state.router.pending(message_id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(runtime.state.router.stats().acknowledged, 1);
    assert_eq!(runtime.state.queue.depth(), 0);
    assert_eq!(runtime.shutdown().await, 0);
}

#[tokio::test]
async fn test_disconnected_agent_falls_back_to_polling() {
    let runtime = MeshRuntime::start(&test_config());
    register(&runtime, "a1", AgentKind::Analyst);
    let connection = runtime.connect_agent(AgentId::from("a1")).unwrap();
    drop(connection);

    let message = Message::direct(AgentId::from("client"), AgentId::from("a1"), json!({"n": 1}));
    let message_id = message.message_id;
    runtime
        .state
        .router
        .route(message, runtime.state.router.default_context())
        .await
        .unwrap();

    let polled = runtime.state.queue.poll(&NodeId::from("node-a"), 10);
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].message.message_id, message_id);

    runtime.state.router.acknowledge(message_id, &AgentId::from("a1")).await.unwrap();
    assert_eq!(runtime.state.queue.depth(), 0);
    assert_eq!(runtime.shutdown().await, 0);
}

#[tokio::test]
async fn test_shutdown_releases_unacknowledged_deliveries() {
    let runtime = MeshRuntime::start(&test_config());
    register(&runtime, "a1", AgentKind::Analyst);

    let message = Message::direct(AgentId::from("client"), AgentId::from("a1"), json!(null));
    runtime
        .state
        .router
        .route(message, runtime.state.router.default_context())
        .await
        .unwrap();

    let manager = runtime.state.manager.clone();
    let released = runtime.shutdown().await;
    assert_eq!(released, 1);
    assert_eq!(manager.get(&AgentId::from("a1")).unwrap().inflight_count, 0);
}

#[tokio::test]
async fn test_client_against_running_server() {
    let runtime = MeshRuntime::start(&test_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = app(runtime.state.clone());
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    assert!(matches!(
        check_daemon_running("127.0.0.1", port).await,
        DaemonStatus::Running { .. }
    ));

    let client = MeshClient::new("127.0.0.1", port).unwrap();
    let registered = client
        .register_agent(
            &RegistrationRequest::new(AgentKind::Researcher, vec![Capability::new("search")], NodeId::from("node-a"))
                .with_agent_id("r1"),
        )
        .await
        .unwrap();
    assert_eq!(registered.state, AgentState::Active);

    let duplicate = client
        .register_agent(&RegistrationRequest::new(AgentKind::Researcher, vec![], NodeId::from("node-a")).with_agent_id("r1"))
        .await
        .unwrap_err();
    assert!(duplicate.to_string().contains("duplicate_active_registration"));

    let found = client.list_agents(&DiscoveryQuery::capability("search")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(client.capabilities().await.unwrap().contains_key(&Capability::new("research")));

    let decision = client
        .send_message(&SendMessageRequest {
            message_id: None,
            from_agent_id: AgentId::from("client"),
            to_agent_id: None,
            capability: Some(Capability::new("research")),
            payload: json!({"q": "rust"}),
            delivery_mode: Some(DeliveryMode::CapabilityRouted),
            kind: MessageKind::Request,
            timeout_ms: Some(1_000),
        })
        .await
        .unwrap();
    assert_eq!(decision.targets[0].agent_id.as_str(), "r1");

    let pending = client.message_status(decision.message_id).await.unwrap();
    assert_eq!(pending.outstanding, vec![AgentId::from("r1")]);
    client.acknowledge(decision.message_id, &AgentId::from("r1")).await.unwrap();

    assert!(client.heartbeat(&AgentId::from("r1")).await.unwrap());
    let drained = client.remove_agent(&AgentId::from("r1"), true).await.unwrap();
    assert_eq!(drained.state, AgentState::Draining);

    let metrics = client.metrics().await.unwrap();
    assert_eq!(metrics.messages_routed, 1);
    assert_eq!(metrics.acknowledged, 1);

    server.abort();
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_coordinator_is_stopped() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    assert_eq!(check_daemon_running("127.0.0.1", port).await, DaemonStatus::Stopped);
}
