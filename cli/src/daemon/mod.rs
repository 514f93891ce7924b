// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordinator process and its HTTP client
//!
//! Handles:
//! - Wiring the mesh services and serving the admin API
//! - Health checks against a running coordinator
//! - Graceful shutdown

use std::time::Duration;

pub mod client;
pub mod server;

pub use client::MeshClient;
pub use server::{serve, MeshRuntime, ServeOptions};

pub const DEFAULT_PORT: u16 = 8700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { uptime: u64 },
    ShuttingDown,
    Stopped,
    Unhealthy { error: String },
}

/// Probe `/health` with a short timeout.
pub async fn check_daemon_running(host: &str, port: u16) -> DaemonStatus {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
    {
        Ok(client) => client,
        Err(e) => return DaemonStatus::Unhealthy { error: e.to_string() },
    };

    let health_url = format!("{}/health", client::base_url(host, port));
    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
            let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
            if body["status"] == "shutting_down" {
                DaemonStatus::ShuttingDown
            } else {
                DaemonStatus::Running { uptime }
            }
        }
        Ok(resp) => DaemonStatus::Unhealthy {
            error: format!("HTTP {}", resp.status()),
        },
        Err(e) if e.is_connect() || e.is_timeout() => DaemonStatus::Stopped,
        Err(e) => DaemonStatus::Unhealthy { error: e.to_string() },
    }
}

/// Fail early with a readable message when the coordinator is not reachable.
pub async fn require_running(host: &str, port: u16) -> anyhow::Result<()> {
    match check_daemon_running(host, port).await {
        DaemonStatus::Running { .. } => Ok(()),
        DaemonStatus::ShuttingDown => anyhow::bail!("Coordinator at {}:{} is shutting down", host, port),
        DaemonStatus::Stopped => anyhow::bail!(
            "No coordinator reachable at {}:{}. Start one with 'agentmesh serve'.",
            host,
            port
        ),
        DaemonStatus::Unhealthy { error } => {
            anyhow::bail!("Coordinator at {}:{} is unhealthy: {}", host, port, error)
        }
    }
}
