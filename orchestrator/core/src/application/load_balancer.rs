// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Load Balancer
//!
//! Least-loaded selection with a stable tie-break. Candidates are ordered by
//! `inflight_count`, then `registered_at`, then registration sequence; the
//! first candidate whose reservation succeeds wins.
//!
//! Selection and reservation are one logical operation: the capacity check
//! and the `inflight_count` increment happen inside the registry's per-record
//! critical section (`try_reserve`), so concurrent selectors never push an
//! instance past its `capacity_hint`. The caller owns the returned
//! [`Reservation`] and must release it exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::domain::agent::{AgentDescriptor, AgentId, Capability, NodeId};
use crate::domain::registry::{AgentRegistry, ReserveOutcome};
use crate::domain::routing::{LoadSnapshot, Reservation, RoutingError};

/// A reserved target.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub reservation: Reservation,
}

pub struct LoadBalancer {
    registry: Arc<dyn AgentRegistry>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<dyn AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Current load of every Active instance advertising `capability`, in selection order.
    pub fn snapshots(&self, capability: &Capability) -> Vec<LoadSnapshot> {
        let mut snapshots: Vec<LoadSnapshot> = self
            .registry
            .find_by_capability(capability)
            .iter()
            .map(LoadSnapshot::from)
            .collect();
        snapshots.sort_by(LoadSnapshot::selection_order);
        snapshots
    }

    /// Pick and reserve the least-loaded Active instance advertising `capability`.
    pub fn select_for(&self, capability: &Capability) -> Result<Selection, RoutingError> {
        let candidates = self.registry.find_by_capability(capability);
        self.pick(&candidates, &HashSet::new(), capability.as_str())
    }

    /// Pick and reserve one of `candidates`.
    pub fn select(&self, candidates: &[AgentDescriptor]) -> Result<Selection, RoutingError> {
        self.pick(candidates, &HashSet::new(), "candidate set")
    }

    /// Like [`select`](Self::select), ignoring the `excluded` instances.
    pub fn select_excluding(
        &self,
        candidates: &[AgentDescriptor],
        excluded: &HashSet<AgentId>,
    ) -> Result<Selection, RoutingError> {
        self.pick(candidates, excluded, "candidate set")
    }

    fn pick(
        &self,
        candidates: &[AgentDescriptor],
        excluded: &HashSet<AgentId>,
        label: &str,
    ) -> Result<Selection, RoutingError> {
        let mut ordered: Vec<(LoadSnapshot, &AgentDescriptor)> = candidates
            .iter()
            .filter(|c| !excluded.contains(&c.agent_id))
            .map(|c| (LoadSnapshot::from(c), c))
            .collect();

        if ordered.is_empty() {
            return Err(RoutingError::NoCapableAgent(label.to_string()));
        }
        ordered.sort_by(|(a, _), (b, _)| a.selection_order(b));

        let mut at_capacity = 0usize;
        for (snapshot, candidate) in &ordered {
            match self.registry.try_reserve(&snapshot.agent_id, true) {
                Ok(ReserveOutcome::Reserved(reservation)) if reservation.instance == snapshot.instance => {
                    debug!(
                        agent_id = %snapshot.agent_id,
                        inflight = snapshot.inflight_count,
                        "Selected least-loaded agent"
                    );
                    return Ok(Selection {
                        agent_id: snapshot.agent_id.clone(),
                        node_id: candidate.node_id.clone(),
                        reservation,
                    });
                }
                Ok(ReserveOutcome::Reserved(reservation)) => {
                    // Re-registered since the candidate list was read
                    let _ = self.registry.release(&reservation);
                }
                Ok(ReserveOutcome::AtCapacity) => at_capacity += 1,
                Ok(ReserveOutcome::NotEligible(state)) => {
                    debug!(agent_id = %snapshot.agent_id, state = %state, "Candidate no longer eligible");
                }
                Err(e) => {
                    debug!(agent_id = %snapshot.agent_id, error = %e, "Candidate vanished");
                }
            }
        }

        if at_capacity > 0 {
            Err(RoutingError::Overloaded { candidates: at_capacity })
        } else {
            Err(RoutingError::NoCapableAgent(label.to_string()))
        }
    }
}
