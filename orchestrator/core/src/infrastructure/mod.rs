// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod delivery;
pub mod event_bus;
pub mod metrics;
pub mod registry;
pub mod transport;

pub use delivery::InMemoryDeliveryQueue;
pub use event_bus::{EventBus, MeshEvent};
pub use registry::InMemoryAgentRegistry;
pub use transport::{AgentConnection, ConnectionHub};
