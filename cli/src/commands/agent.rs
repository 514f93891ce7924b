// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent registry commands
//!
//! Commands: list, show, register, remove, drain, heartbeat, capabilities

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::collections::HashMap;

use agentmesh_core::application::agent_manager::RegistrationRequest;
use agentmesh_core::application::discovery::DiscoveryQuery;
use agentmesh_core::domain::agent::{AgentId, AgentKind, AgentState, Capability, NodeId};
use agentmesh_core::presentation::api::AgentSummary;

use crate::daemon::{require_running, MeshClient};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List registered agents
    List {
        /// Only agents advertising this capability
        #[arg(long)]
        capability: Option<String>,

        /// Only agents of this kind (researcher, analyst, coordinator, knowledge, generic)
        #[arg(long)]
        kind: Option<AgentKind>,

        /// Only agents hosted on this node
        #[arg(long)]
        node: Option<String>,

        /// Only agents in this state (registering, active, draining, offline)
        #[arg(long)]
        state: Option<AgentState>,
    },

    /// Show one agent record (YAML)
    Show {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// Register an agent
    Register {
        /// Node hosting the agent
        #[arg(long)]
        node: String,

        /// Agent kind; contributes default capabilities
        #[arg(long, default_value = "generic")]
        kind: AgentKind,

        /// Agent id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Capability tag (repeatable)
        #[arg(long = "capability", value_name = "TAG")]
        capabilities: Vec<String>,

        /// Maximum concurrent in-flight messages
        #[arg(long)]
        capacity: Option<u32>,

        /// Metadata entry KEY=VALUE (repeatable)
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Replace a live record holding the same id
        #[arg(long)]
        force: bool,
    },

    /// Remove an agent (immediately offline unless --drain)
    Remove {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,

        /// Stop new routing and let in-flight work finish
        #[arg(long)]
        drain: bool,
    },

    /// Stop routing new work to an agent
    Drain {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// Send a heartbeat on behalf of an agent
    Heartbeat {
        #[arg(value_name = "AGENT_ID")]
        agent_id: String,
    },

    /// Show routable agents per capability
    Capabilities,
}

pub async fn handle_command(command: AgentCommand, host: &str, port: u16) -> Result<()> {
    require_running(host, port).await?;
    let client = MeshClient::new(host, port)?;

    match command {
        AgentCommand::List {
            capability,
            kind,
            node,
            state,
        } => {
            let query = DiscoveryQuery {
                capability: capability.map(Capability::new),
                kind,
                node_id: node.as_deref().map(NodeId::from),
                state,
            };
            list_agents(&client, &query).await
        }
        AgentCommand::Show { agent_id } => show_agent(&client, agent_id.into()).await,
        AgentCommand::Register {
            node,
            kind,
            id,
            name,
            capabilities,
            capacity,
            metadata,
            force,
        } => {
            let request = RegistrationRequest {
                agent_id: id.map(AgentId::from),
                name,
                kind,
                capabilities: capabilities.into_iter().map(Capability::new).collect(),
                node_id: NodeId::from(node.as_str()),
                capacity_hint: capacity,
                metadata: metadata.into_iter().collect::<HashMap<_, _>>(),
                force,
            };
            register_agent(&client, &request).await
        }
        AgentCommand::Remove { agent_id, drain } => remove_agent(&client, agent_id.into(), drain).await,
        AgentCommand::Drain { agent_id } => {
            let agent = client.drain_agent(&AgentId::from(agent_id)).await?;
            println!(
                "{}",
                format!("✓ Agent {} is {} ({} in flight)", agent.agent_id, agent.state, agent.inflight_count).green()
            );
            Ok(())
        }
        AgentCommand::Heartbeat { agent_id } => {
            let agent_id = AgentId::from(agent_id);
            if client.heartbeat(&agent_id).await? {
                println!("{}", format!("✓ Heartbeat recorded for {}", agent_id).green());
            } else {
                println!("{}", format!("⚠ Heartbeat for {} was older than the stored one", agent_id).yellow());
            }
            Ok(())
        }
        AgentCommand::Capabilities => list_capabilities(&client).await,
    }
}

async fn list_agents(client: &MeshClient, query: &DiscoveryQuery) -> Result<()> {
    let agents = client.list_agents(query).await?;

    if agents.is_empty() {
        println!("{}", "No agents found".yellow());
        return Ok(());
    }

    println!("{} agents found:", agents.len());
    println!(
        "{:<28} {:<12} {:<10} {:<16} {:<9} {}",
        "ID", "KIND", "STATE", "NODE", "INFLIGHT", "CAPABILITIES"
    );
    for agent in &agents {
        println!("{}", format_row(agent));
    }

    Ok(())
}

async fn show_agent(client: &MeshClient, agent_id: AgentId) -> Result<()> {
    let descriptor = client.get_agent(&agent_id).await?;
    let yaml = serde_yaml::to_string(&descriptor).context("Failed to render agent as YAML")?;
    println!("{}", yaml);
    Ok(())
}

async fn register_agent(client: &MeshClient, request: &RegistrationRequest) -> Result<()> {
    let descriptor = client.register_agent(request).await?;
    let capabilities: Vec<String> = descriptor.capabilities.iter().map(ToString::to_string).collect();
    println!("{}", format!("✓ Agent registered: {}", descriptor.agent_id).green());
    println!("  Node: {}", descriptor.node_id);
    println!("  Capabilities: {}", capabilities.join(", "));
    Ok(())
}

async fn remove_agent(client: &MeshClient, agent_id: AgentId, drain: bool) -> Result<()> {
    let agent = client.remove_agent(&agent_id, drain).await?;
    if drain {
        println!(
            "{}",
            format!("✓ Agent {} draining ({} in flight)", agent.agent_id, agent.inflight_count).green()
        );
    } else {
        println!("{}", format!("✓ Agent {} removed", agent.agent_id).green());
    }
    Ok(())
}

async fn list_capabilities(client: &MeshClient) -> Result<()> {
    let catalog = client.capabilities().await?;
    if catalog.is_empty() {
        println!("{}", "No capabilities registered".yellow());
        return Ok(());
    }

    println!("{:<24} {}", "CAPABILITY", "ACTIVE AGENTS");
    for (capability, count) in catalog {
        let count = if count == 0 {
            count.to_string().red()
        } else {
            count.to_string().normal()
        };
        println!("{:<24} {}", capability.to_string().bold(), count);
    }
    Ok(())
}

fn format_row(agent: &AgentSummary) -> String {
    let state = match agent.state {
        AgentState::Active => agent.state.to_string().green(),
        AgentState::Draining => agent.state.to_string().yellow(),
        AgentState::Offline => agent.state.to_string().red(),
        AgentState::Registering => agent.state.to_string().dimmed(),
    };
    let inflight = match agent.capacity_hint {
        Some(capacity) => format!("{}/{}", agent.inflight_count, capacity),
        None => agent.inflight_count.to_string(),
    };
    let capabilities: Vec<String> = agent.capabilities.iter().map(ToString::to_string).collect();

    format!(
        "{:<28} {:<12} {:<10} {:<16} {:<9} {}",
        agent.agent_id.as_str().bold(),
        agent.kind,
        state,
        agent.node_id,
        inflight,
        capabilities.join(",")
    )
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
