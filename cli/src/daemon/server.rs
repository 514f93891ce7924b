// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordinator HTTP server and the services behind it.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agentmesh_core::{
    application::{
        agent_manager::AgentManager, discovery::DiscoveryService, frame_handler::MeshFrameHandler,
        message_router::MessageRouter,
    },
    domain::{
        agent::AgentId,
        mesh_config::MeshConfigManifest,
        transport::{Transport, TransportError},
    },
    infrastructure::{
        delivery::InMemoryDeliveryQueue,
        event_bus::EventBus,
        metrics,
        registry::InMemoryAgentRegistry,
        transport::{AgentConnection, ConnectionHub},
    },
    presentation::{app, AppState},
};

/// Command-line overrides for `serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Every service of one coordinator process, wired together.
pub struct MeshRuntime {
    pub state: Arc<AppState>,
    pub event_bus: EventBus,
    pub hub: Arc<ConnectionHub>,
    pub frame_handler: Arc<MeshFrameHandler>,
    config: MeshConfigManifest,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshRuntime {
    /// Build the services and start the health monitor and ack reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &MeshConfigManifest) -> Self {
        let spec = &config.spec;
        let event_bus = EventBus::with_default_capacity();
        let registry = Arc::new(InMemoryAgentRegistry::new(event_bus.clone()));
        let hub = Arc::new(ConnectionHub::new(spec.transport.connection_buffer));
        let queue = Arc::new(InMemoryDeliveryQueue::new(spec.delivery.per_node_capacity).with_transport(hub.clone()));

        let manager = Arc::new(AgentManager::new(
            registry.clone(),
            event_bus.clone(),
            spec.health.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            queue.clone(),
            event_bus.clone(),
            spec.routing.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(registry));
        let frame_handler = Arc::new(MeshFrameHandler::new(manager.clone(), router.clone()));

        let cancel = CancellationToken::new();
        let tasks = vec![
            manager.spawn_health_monitor(cancel.child_token()),
            tokio::spawn(
                router
                    .clone()
                    .run_reaper(spec.health.check_interval, cancel.child_token()),
            ),
        ];

        info!(
            node_id = %spec.node.id,
            heartbeat_timeout = ?spec.health.heartbeat_timeout,
            max_route_attempts = spec.routing.max_route_attempts,
            "Mesh services started"
        );

        Self {
            state: Arc::new(AppState::new(manager, router, discovery, queue)),
            event_bus,
            hub,
            frame_handler,
            config: config.clone(),
            cancel,
            tasks,
        }
    }

    /// Open an in-process connection for an agent; its frames are handled by the mesh.
    pub fn connect_agent(&self, agent_id: AgentId) -> Result<AgentConnection, TransportError> {
        let connection = self.hub.connect(agent_id.clone())?;
        self.hub.on_receive(&agent_id, self.frame_handler.clone())?;
        Ok(connection)
    }

    /// Stop background tasks, settle the router and close the queue and
    /// connections. Returns the number of deliveries released unacknowledged.
    pub async fn shutdown(self) -> usize {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let released = self
            .state
            .router
            .shutdown(self.config.spec.routing.shutdown_grace)
            .await;
        self.state.queue.close();
        self.hub.shutdown().await;
        info!(released, "Mesh services stopped");
        released
    }
}

pub async fn serve(mut config: MeshConfigManifest, options: ServeOptions) -> Result<()> {
    if let Some(bind) = options.bind {
        config.spec.network.bind_address = bind;
    }
    if let Some(port) = options.port {
        config.spec.network.port = port;
    }
    config.validate().context("Configuration validation failed")?;

    info!(
        node_id = %config.spec.node.id,
        name = %config.metadata.name,
        "Configuration loaded"
    );

    let network = &config.spec.network;
    let metrics_config = &config.spec.observability.metrics;
    if metrics_config.enabled {
        let addr: SocketAddr = format!("{}:{}", network.bind_address, metrics_config.port)
            .parse()
            .with_context(|| format!("Invalid metrics address {}:{}", network.bind_address, metrics_config.port))?;
        metrics::install_prometheus(addr)?;
    }

    let addr = format!("{}:{}", network.bind_address, network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let runtime = MeshRuntime::start(&config);
    info!("Coordinator listening on {}", addr);

    let served = axum::serve(listener, app(runtime.state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    info!("Coordinator shutting down");
    let released = runtime.shutdown().await;
    if released > 0 {
        warn!(released, "Deliveries released without acknowledgement");
    }

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
