// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Health Monitor
//!
//! Two-stage expiry of silent agents. Every tick:
//!
//! 1. Active or Draining records whose last heartbeat is older than
//!    `heartbeat_timeout` move to Offline (`HeartbeatExpired`).
//! 2. Draining records with no work left move to Offline (`DrainCompleted`).
//! 3. Offline records older than `retention_window` are purged, freeing the id.
//!
//! Every write is a compare-and-transition against the record as it was
//! read, so a heartbeat or re-registration racing the sweep wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentDescriptor, AgentId, AgentState};
use crate::domain::events::{AgentLifecycleEvent, EvictionReason};
use crate::domain::mesh_config::HealthConfig;
use crate::domain::registry::{AgentRegistry, Transition};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::metrics;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<AgentId>,
    pub drained: Vec<AgentId>,
    pub purged: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.drained.is_empty() && self.purged.is_empty()
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

pub struct HealthMonitor {
    registry: Arc<dyn AgentRegistry>,
    event_bus: EventBus,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<dyn AgentRegistry>, event_bus: EventBus, config: HealthConfig) -> Self {
        Self {
            registry,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run one sweep as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = to_chrono(self.config.heartbeat_timeout);
        let retention = to_chrono(self.config.retention_window);
        let mut report = SweepReport::default();

        for record in self.registry.list() {
            let state = record.state;
            match state {
                AgentState::Active | AgentState::Draining if record.heartbeat_expired(now, timeout) => {
                    if self.evict(&record, now, EvictionReason::HeartbeatExpired, &|current| {
                        matches!(current.state, AgentState::Active | AgentState::Draining)
                            && current.heartbeat_expired(now, timeout)
                    }) {
                        report.expired.push(record.agent_id);
                    }
                }
                AgentState::Draining if record.inflight_count == 0 => {
                    if self.evict(&record, now, EvictionReason::DrainCompleted, &|current| {
                        current.state == AgentState::Draining && current.inflight_count == 0
                    }) {
                        report.drained.push(record.agent_id);
                    }
                }
                AgentState::Offline if retention_elapsed(&record, now, retention) => {
                    let instance = record.instance;
                    let purged = self.registry.purge_if(&record.agent_id, &|current| {
                        current.instance == instance
                            && current.state == AgentState::Offline
                            && retention_elapsed(current, now, retention)
                    });
                    match purged {
                        Ok(Some(_)) => report.purged.push(record.agent_id),
                        Ok(None) => {}
                        Err(e) => debug!(agent_id = %record.agent_id, error = %e, "Purge skipped"),
                    }
                }
                _ => {}
            }
        }

        metrics::record_state_counts(&self.registry.counts());
        if !report.is_empty() {
            info!(
                expired = report.expired.len(),
                drained = report.drained.len(),
                purged = report.purged.len(),
                "Health sweep applied changes"
            );
        }
        report
    }

    fn evict(
        &self,
        record: &AgentDescriptor,
        now: DateTime<Utc>,
        reason: EvictionReason,
        condition: &dyn Fn(&AgentDescriptor) -> bool,
    ) -> bool {
        let instance = record.instance;
        let outcome = self.registry.transition_if(&record.agent_id, AgentState::Offline, now, &|current| {
            current.instance == instance && condition(current)
        });

        match outcome {
            Ok(Transition::Applied { from, .. }) => {
                if reason == EvictionReason::HeartbeatExpired {
                    warn!(
                        agent_id = %record.agent_id,
                        from = %from,
                        last_heartbeat_at = %record.last_heartbeat_at,
                        "Agent heartbeat expired, marking offline"
                    );
                } else {
                    info!(agent_id = %record.agent_id, "Drain completed, agent offline");
                }
                ::metrics::counter!(metrics::AGENTS_EVICTED_TOTAL, "reason" => reason.as_str()).increment(1);
                self.event_bus.publish_agent_event(AgentLifecycleEvent::AgentEvicted {
                    agent_id: record.agent_id.clone(),
                    reason,
                    evicted_at: now,
                });
                true
            }
            Ok(Transition::Skipped(_)) => false,
            Err(e) => {
                debug!(agent_id = %record.agent_id, error = %e, "Eviction skipped");
                false
            }
        }
    }

    /// Sweep every `check_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.config.check_interval,
            heartbeat_timeout = ?self.config.heartbeat_timeout,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_at(Utc::now());
                }
            }
        }
        info!("Health monitor stopped");
    }
}

fn retention_elapsed(record: &AgentDescriptor, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
    record
        .offline_since
        .map(|since| now - since > retention)
        .unwrap_or(false)
}
