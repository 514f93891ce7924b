// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent_manager;
pub mod discovery;
pub mod frame_handler;
pub mod health_monitor;
pub mod load_balancer;
pub mod message_router;

// Re-export use cases for convenience
pub use agent_manager::{AgentManager, RegistrationRequest};
pub use discovery::{DiscoveryQuery, DiscoveryService};
pub use frame_handler::MeshFrameHandler;
pub use health_monitor::{HealthMonitor, SweepReport};
pub use load_balancer::{LoadBalancer, Selection};
pub use message_router::{MessageRouter, PendingRoute, RejectOutcome, RouteContext, RouterStats};
