// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use colored::Colorize;

use agentmesh_core::presentation::api::MetricsResponse;

use crate::daemon::{require_running, MeshClient};

pub async fn show(json: bool, host: &str, port: u16) -> Result<()> {
    require_running(host, port).await?;
    let client = MeshClient::new(host, port)?;
    let metrics = client.metrics().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        print!("{}", render(&metrics));
    }
    Ok(())
}

fn render(metrics: &MetricsResponse) -> String {
    let counts = &metrics.agents_by_state;
    let failure_rate = format!("{:.1}%", metrics.failure_rate * 100.0);
    let failure_rate = if metrics.failure_rate > 0.1 {
        failure_rate.red()
    } else {
        failure_rate.normal()
    };

    let mut out = String::new();
    out.push_str(&format!("{}\n", "Agents:".bold()));
    out.push_str(&format!("  Active: {}\n", counts.active));
    out.push_str(&format!("  Draining: {}\n", counts.draining));
    out.push_str(&format!("  Offline: {}\n", counts.offline));
    out.push_str(&format!("  Registering: {}\n", counts.registering));
    out.push_str(&format!("{}\n", "Routing:".bold()));
    out.push_str(&format!("  Routed: {}\n", metrics.messages_routed));
    out.push_str(&format!("  Failed: {}\n", metrics.routing_failures));
    out.push_str(&format!("  Failure rate: {}\n", failure_rate));
    out.push_str(&format!("  Duplicates: {}\n", metrics.duplicates));
    out.push_str(&format!("{}\n", "Deliveries:".bold()));
    out.push_str(&format!("  Pending: {}\n", metrics.pending_deliveries));
    out.push_str(&format!("  Queue depth: {}\n", metrics.queue_depth));
    out.push_str(&format!("  Acknowledged: {}\n", metrics.acknowledged));
    out.push_str(&format!("  Rejected: {}\n", metrics.rejected));
    out.push_str(&format!("  Expired: {}\n", metrics.expired));
    out.push_str(&format!("Uptime: {}s\n", metrics.uptime_seconds));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::domain::registry::StateCounts;

    #[test]
    fn test_render_includes_counters() {
        colored::control::set_override(false);
        let metrics = MetricsResponse {
            active_agents: 2,
            agents_by_state: StateCounts {
                active: 2,
                offline: 1,
                ..Default::default()
            },
            queue_depth: 3,
            pending_deliveries: 3,
            messages_routed: 9,
            routing_failures: 1,
            duplicates: 0,
            acknowledged: 6,
            rejected: 0,
            expired: 0,
            failure_rate: 0.1,
            uptime_seconds: 42,
        };

        let text = render(&metrics);
        assert!(text.contains("Active: 2"));
        assert!(text.contains("Failure rate: 10.0%"));
        assert!(text.contains("Uptime: 42s"));
    }
}
