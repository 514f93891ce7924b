// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the agentmesh CLI

pub mod agent;
pub mod config;
pub mod message;
pub mod metrics;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::message::{MessageCommand, SendArgs};
