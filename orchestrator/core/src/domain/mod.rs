// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and port traits of the mesh: agent records, messages, routing
//! value objects, and the registry, delivery and transport seams.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and ports with no I/O

pub mod agent;
pub mod delivery;
pub mod events;
pub mod mesh_config;
pub mod message;
pub mod registry;
pub mod routing;
pub mod transport;
