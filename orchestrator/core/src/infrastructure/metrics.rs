// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Metrics - Prometheus instrumentation for the mesh
//
// Metric names live here so every component records under the same keys.
// Recording goes through the `metrics` facade and is a no-op until a
// recorder is installed, which keeps unit tests free of global state.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::domain::registry::StateCounts;

// ============================================================================
// Routing
// ============================================================================

/// Messages handed to at least one target, labelled by `mode`
pub const MESSAGES_ROUTED_TOTAL: &str = "agentmesh_messages_routed_total";

/// Routes that surfaced an error, labelled by `mode` and `error`
pub const ROUTING_FAILURES_TOTAL: &str = "agentmesh_routing_failures_total";

/// Duplicate submissions answered from the idempotence cache
pub const DUPLICATE_MESSAGES_TOTAL: &str = "agentmesh_duplicate_messages_total";

/// Dispatched messages whose ack never arrived
pub const DELIVERIES_EXPIRED_TOTAL: &str = "agentmesh_deliveries_expired_total";

/// Time from route() entry to decision, labelled by `mode`
pub const ROUTE_LATENCY_SECONDS: &str = "agentmesh_route_latency_seconds";

// ============================================================================
// Registry
// ============================================================================

/// Records moved to Offline, labelled by `reason`
pub const AGENTS_EVICTED_TOTAL: &str = "agentmesh_agents_evicted_total";

/// Releases clamped at zero
pub const INFLIGHT_UNDERFLOW_TOTAL: &str = "agentmesh_inflight_underflow_total";

/// Current records, labelled by `state`
pub const AGENTS: &str = "agentmesh_agents";

/// Envelopes enqueued and not yet settled
pub const DELIVERY_QUEUE_DEPTH: &str = "agentmesh_delivery_queue_depth";

/// Register descriptions with whichever recorder is installed.
pub fn describe_metrics() {
    describe_counter!(MESSAGES_ROUTED_TOTAL, "Messages handed to at least one target");
    describe_counter!(ROUTING_FAILURES_TOTAL, "Routes that surfaced an error");
    describe_counter!(DUPLICATE_MESSAGES_TOTAL, "Duplicate message submissions");
    describe_counter!(DELIVERIES_EXPIRED_TOTAL, "Dispatched messages never acknowledged");
    describe_histogram!(ROUTE_LATENCY_SECONDS, Unit::Seconds, "Routing latency");
    describe_counter!(AGENTS_EVICTED_TOTAL, "Agents moved to offline");
    describe_counter!(INFLIGHT_UNDERFLOW_TOTAL, "In-flight releases clamped at zero");
    describe_gauge!(AGENTS, "Registered agents by lifecycle state");
    describe_gauge!(DELIVERY_QUEUE_DEPTH, "Envelopes awaiting acknowledgement");
}

pub fn record_state_counts(counts: &StateCounts) {
    metrics::gauge!(AGENTS, "state" => "registering").set(counts.registering as f64);
    metrics::gauge!(AGENTS, "state" => "active").set(counts.active as f64);
    metrics::gauge!(AGENTS, "state" => "draining").set(counts.draining as f64);
    metrics::gauge!(AGENTS, "state" => "offline").set(counts.offline as f64);
}

/// Install the global Prometheus recorder with its own scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter on {}: {}", addr, e))?;
    describe_metrics();
    tracing::info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}
