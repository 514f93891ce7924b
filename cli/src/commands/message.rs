// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Message routing commands
//!
//! Commands: send, message status|ack|reject

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use agentmesh_core::domain::agent::{AgentId, Capability};
use agentmesh_core::domain::message::{DeliveryMode, MessageId, MessageKind};
use agentmesh_core::presentation::api::{RoutingDecisionResponse, SendMessageRequest};

use crate::daemon::{require_running, MeshClient};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Sending agent id
    #[arg(long)]
    pub from: String,

    /// Deliver to exactly this agent
    #[arg(long, conflicts_with_all = ["capability", "broadcast"])]
    pub to: Option<String>,

    /// Deliver to the least-loaded agent with this capability (or filter a broadcast)
    #[arg(long)]
    pub capability: Option<String>,

    /// Deliver to every active agent except the sender
    #[arg(long)]
    pub broadcast: bool,

    /// JSON payload, or @FILE to read it from a file
    #[arg(long, default_value = "null")]
    pub payload: String,

    /// Message kind (request, response, notification, error)
    #[arg(long, default_value = "request", value_parser = parse_message_kind)]
    pub kind: MessageKind,

    /// Reuse a message id to make the send idempotent
    #[arg(long)]
    pub id: Option<String>,

    /// Route deadline in milliseconds (default: coordinator setting)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl SendArgs {
    pub fn into_request(self) -> Result<SendMessageRequest> {
        let payload = read_payload(&self.payload)?;
        let message_id = self
            .id
            .as_deref()
            .map(MessageId::from_string)
            .transpose()
            .context("Invalid message id, expected a UUID")?;
        let delivery_mode = match (&self.to, self.broadcast) {
            (Some(_), _) => DeliveryMode::Direct,
            (None, true) => DeliveryMode::Broadcast,
            (None, false) if self.capability.is_some() => DeliveryMode::CapabilityRouted,
            (None, false) => anyhow::bail!("Specify one of --to, --capability or --broadcast"),
        };

        Ok(SendMessageRequest {
            message_id,
            from_agent_id: AgentId::from(self.from),
            to_agent_id: self.to.map(AgentId::from),
            capability: self.capability.map(Capability::new),
            payload,
            delivery_mode: Some(delivery_mode),
            kind: self.kind,
            timeout_ms: self.timeout_ms,
        })
    }
}

#[derive(Subcommand)]
pub enum MessageCommand {
    /// Show outstanding deliveries of a message
    Status {
        #[arg(value_name = "MESSAGE_ID")]
        message_id: String,
    },

    /// Acknowledge a delivery on behalf of the recipient
    Ack {
        #[arg(value_name = "MESSAGE_ID")]
        message_id: String,

        /// Recipient agent id
        #[arg(long)]
        agent: String,
    },

    /// Reject a delivery on behalf of the recipient
    Reject {
        #[arg(value_name = "MESSAGE_ID")]
        message_id: String,

        /// Recipient agent id
        #[arg(long)]
        agent: String,

        #[arg(long, default_value = "")]
        reason: String,

        /// Re-route a capability message to another agent
        #[arg(long)]
        retry: bool,
    },
}

pub async fn send(args: SendArgs, host: &str, port: u16) -> Result<()> {
    let request = args.into_request()?;
    require_running(host, port).await?;
    let client = MeshClient::new(host, port)?;

    let decision = client.send_message(&request).await?;
    print_decision(&decision);
    Ok(())
}

pub async fn handle_command(command: MessageCommand, host: &str, port: u16) -> Result<()> {
    require_running(host, port).await?;
    let client = MeshClient::new(host, port)?;

    match command {
        MessageCommand::Status { message_id } => {
            let pending = client.message_status(parse_message_id(&message_id)?).await?;
            println!("Message {}", pending.message_id.to_string().bold());
            println!("  Status: {:?}", pending.status);
            if let Some(policy) = pending.policy {
                println!("  Policy: {:?}", policy);
            }
            println!("  Attempts: {}", pending.attempts);
            for agent_id in &pending.outstanding {
                println!("  Awaiting: {}", agent_id);
            }
            Ok(())
        }
        MessageCommand::Ack { message_id, agent } => {
            let message_id = parse_message_id(&message_id)?;
            client.acknowledge(message_id, &AgentId::from(agent.as_str())).await?;
            println!("{}", format!("✓ Message {} acknowledged by {}", message_id, agent).green());
            Ok(())
        }
        MessageCommand::Reject {
            message_id,
            agent,
            reason,
            retry,
        } => {
            let message_id = parse_message_id(&message_id)?;
            let response = client
                .reject(message_id, &AgentId::from(agent.as_str()), &reason, retry)
                .await?;
            match (response.status.as_str(), response.decision, response.error) {
                ("rerouted", Some(decision), _) => {
                    println!("{}", format!("✓ Message {} re-routed", message_id).green());
                    print_decision(&decision);
                }
                ("reroute_failed", _, error) => {
                    println!(
                        "{}",
                        format!(
                            "⚠ Message {} rejected, re-route failed: {}",
                            message_id,
                            error.unwrap_or_default()
                        )
                        .yellow()
                    );
                }
                _ => println!("{}", format!("✓ Message {} rejected", message_id).green()),
            }
            Ok(())
        }
    }
}

fn print_decision(decision: &RoutingDecisionResponse) {
    println!("{}", format!("✓ Message {} routed", decision.message_id).green());
    println!("  Policy: {:?}", decision.policy);
    println!("  Attempts: {}", decision.attempts);
    for target in &decision.targets {
        println!("  → {} on {}", target.agent_id.as_str().bold(), target.node_id);
    }
    for failed in &decision.failed {
        println!("  {} {}: {}", "✗".red(), failed.agent_id, failed.reason);
    }
}

fn read_payload(raw: &str) -> Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => {
            let path = PathBuf::from(path);
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read payload file {:?}", path))?
        }
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    MessageId::from_string(raw).with_context(|| format!("Invalid message id '{}', expected a UUID", raw))
}

fn parse_message_kind(raw: &str) -> Result<MessageKind, String> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
        .map_err(|_| format!("unknown message kind '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args() -> SendArgs {
        SendArgs {
            from: "client".to_string(),
            to: None,
            capability: None,
            broadcast: false,
            payload: "null".to_string(),
            kind: MessageKind::Request,
            id: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_delivery_mode_follows_addressing_flags() {
        let direct = SendArgs {
            to: Some("a1".to_string()),
            ..args()
        };
        assert_eq!(direct.into_request().unwrap().delivery_mode, Some(DeliveryMode::Direct));

        let routed = SendArgs {
            capability: Some("Analysis".to_string()),
            ..args()
        };
        let request = routed.into_request().unwrap();
        assert_eq!(request.delivery_mode, Some(DeliveryMode::CapabilityRouted));
        assert_eq!(request.capability.unwrap().as_str(), "analysis");

        let filtered_broadcast = SendArgs {
            capability: Some("research".to_string()),
            broadcast: true,
            ..args()
        };
        assert_eq!(
            filtered_broadcast.into_request().unwrap().delivery_mode,
            Some(DeliveryMode::Broadcast)
        );

        assert!(args().into_request().is_err());
    }

    #[test]
    fn test_payload_from_file_and_invalid_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"question": "why"}}"#).unwrap();

        let request = SendArgs {
            broadcast: true,
            payload: format!("@{}", file.path().display()),
            ..args()
        }
        .into_request()
        .unwrap();
        assert_eq!(request.payload["question"], "why");

        let bad_id = SendArgs {
            broadcast: true,
            id: Some("not-a-uuid".to_string()),
            ..args()
        };
        assert!(bad_id.into_request().is_err());
    }

    #[test]
    fn test_parse_message_kind() {
        assert_eq!(parse_message_kind("Notification").unwrap(), MessageKind::Notification);
        assert!(parse_message_kind("shout").is_err());
    }
}
