// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agentmesh Core
//!
//! Agent discovery, message routing and load balancing for a multi-agent mesh.
//!
//! # Architecture
//!
//! - **domain:** agent records, messages, routing value objects and port traits
//! - **application:** agent lifecycle, health monitoring, load balancing, routing
//! - **infrastructure:** in-memory registry, delivery queue, connection hub, event bus, metrics
//! - **presentation:** administrative HTTP API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
