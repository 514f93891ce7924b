// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry Port
//!
//! Concurrent-safe directory of agent instances keyed by [`AgentId`]. The
//! registry is the single shared mutable structure of the mesh; every other
//! component reads and writes agent records exclusively through this trait.
//!
//! ## Write partitioning
//!
//! | Field | Writers |
//! |-------|---------|
//! | `state`, `offline_since` | `AgentManager`, `HealthMonitor` (via `register`, `unregister`, `transition_if`, `purge_if`) |
//! | `inflight_count` | `LoadBalancer`, `MessageRouter` (via `try_reserve`, `release`, `adjust_inflight`) |
//! | `last_heartbeat_at` | `touch_heartbeat` only |
//!
//! Every operation is atomic per record. There are no cross-record
//! transactions, and none of the operations perform I/O.
//!
//! Implementations live in `crate::infrastructure::registry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::agent::{AgentDescriptor, AgentId, AgentState, Capability};
use crate::domain::routing::Reservation;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    NotFound(AgentId),

    #[error("agent {agent_id} is already registered and {state}")]
    DuplicateActiveRegistration { agent_id: AgentId, state: AgentState },

    #[error("agent {agent_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
    },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "not_found",
            RegistryError::DuplicateActiveRegistration { .. } => "duplicate_active_registration",
            RegistryError::InvalidTransition { .. } => "invalid_transition",
            RegistryError::InvalidRegistration(_) => "invalid_registration",
        }
    }
}

/// Result of a successful `register`.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// The stored record, with its registry-assigned `instance`.
    pub descriptor: AgentDescriptor,
    /// The record this registration replaced: an Offline leftover, or an
    /// identity-holding record evicted by a forced registration.
    pub replaced: Option<AgentDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Applied,
    /// Older than the stored heartbeat; discarded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightAdjustment {
    pub inflight_count: u32,
    /// The requested delta would have driven the counter below zero and was clamped.
    pub underflow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    AtCapacity,
    NotEligible(AgentState),
}

#[derive(Debug, Clone)]
pub enum Transition {
    Applied {
        from: AgentState,
        descriptor: AgentDescriptor,
    },
    /// The condition did not hold; nothing changed.
    Skipped(AgentDescriptor),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub registering: usize,
    pub active: usize,
    pub draining: usize,
    pub offline: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.registering + self.active + self.draining + self.offline
    }

    pub fn record(&mut self, state: AgentState) {
        match state {
            AgentState::Registering => self.registering += 1,
            AgentState::Active => self.active += 1,
            AgentState::Draining => self.draining += 1,
            AgentState::Offline => self.offline += 1,
        }
    }
}

pub trait AgentRegistry: Send + Sync {
    /// Insert a new record, or replace an Offline one.
    ///
    /// An existing Registering, Active or Draining record with the same id
    /// fails the call with `DuplicateActiveRegistration` unless `force` is set,
    /// in which case the old record is evicted.
    fn register(&self, descriptor: AgentDescriptor, force: bool) -> Result<RegistrationOutcome, RegistryError>;

    /// Mark a record Offline so it starts its retention window.
    fn unregister(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError>;

    fn lookup(&self, agent_id: &AgentId) -> Result<AgentDescriptor, RegistryError>;

    /// Active records advertising `capability`, in registration order.
    fn find_by_capability(&self, capability: &Capability) -> Vec<AgentDescriptor>;

    /// Every record, in registration order.
    fn list(&self) -> Vec<AgentDescriptor>;

    /// Last-write-wins by timestamp; an older heartbeat is discarded.
    fn touch_heartbeat(&self, agent_id: &AgentId, at: DateTime<Utc>) -> Result<HeartbeatOutcome, RegistryError>;

    /// Atomic add, clamped at zero. Underflow is reported, not returned as an error.
    fn adjust_inflight(&self, agent_id: &AgentId, delta: i64) -> Result<InflightAdjustment, RegistryError>;

    /// Atomically check eligibility (and capacity when `enforce_capacity`),
    /// then claim one in-flight slot.
    fn try_reserve(&self, agent_id: &AgentId, enforce_capacity: bool) -> Result<ReserveOutcome, RegistryError>;

    /// Give back a slot claimed by `try_reserve`. Returns `Ok(None)` when the
    /// reserving instance has since been replaced.
    fn release(&self, reservation: &Reservation) -> Result<Option<InflightAdjustment>, RegistryError>;

    /// Compare-and-transition: move to `to` only if `condition` holds for the
    /// current record.
    fn transition_if(
        &self,
        agent_id: &AgentId,
        to: AgentState,
        at: DateTime<Utc>,
        condition: &dyn Fn(&AgentDescriptor) -> bool,
    ) -> Result<Transition, RegistryError>;

    /// Hard delete if `condition` holds. Returns the removed record.
    fn purge_if(
        &self,
        agent_id: &AgentId,
        condition: &dyn Fn(&AgentDescriptor) -> bool,
    ) -> Result<Option<AgentDescriptor>, RegistryError>;

    fn counts(&self) -> StateCounts;
}
