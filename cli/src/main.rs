// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # agentmesh
//!
//! The `agentmesh` binary runs the mesh coordinator and talks to a running
//! coordinator over its HTTP admin surface.
//!
//! ## Commands
//!
//! - `agentmesh serve` - Run the coordinator in the foreground
//! - `agentmesh agent list|show|register|remove|drain|heartbeat` - Agent registry operations
//! - `agentmesh send` - Route a message through the mesh
//! - `agentmesh message status|ack|reject` - Follow up on a routed message
//! - `agentmesh metrics` - Routing and registry counters
//! - `agentmesh config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use agentmesh_cli::commands::{self, AgentCommand, ConfigCommand, MessageCommand, SendArgs};
use agentmesh_cli::daemon::{self, ServeOptions};
use agentmesh_core::domain::mesh_config::{LogFormat, MeshConfigManifest};

/// agentmesh - agent discovery, message routing and load balancing
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AGENTMESH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port of the coordinator (default: 8700, or the configured port for `serve`)
    #[arg(long, global = true, env = "AGENTMESH_PORT")]
    port: Option<u16>,

    /// HTTP API host of the coordinator (default: 127.0.0.1)
    #[arg(long, global = true, env = "AGENTMESH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AGENTMESH_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    #[command(name = "serve")]
    Serve {
        /// Bind address (default: from configuration)
        #[arg(long)]
        bind: Option<String>,
    },

    #[command(flatten)]
    Client(ClientCommand),
}

/// Commands that talk to a running coordinator, or only touch local files.
#[derive(Subcommand)]
enum ClientCommand {
    /// Agent registry operations
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Route a message
    #[command(name = "send")]
    Send(SendArgs),

    /// Follow up on a routed message
    #[command(name = "message")]
    Message {
        #[command(subcommand)]
        command: MessageCommand,
    },

    /// Show coordinator metrics
    #[command(name = "metrics")]
    Metrics {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { bind }) => {
            let config = MeshConfigManifest::load_or_default(cli.config.clone())
                .context("Failed to load configuration")?;
            let logging = &config.spec.observability.logging;
            let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
            init_logging(&level, logging.format)?;

            info!("Starting agentmesh coordinator");
            daemon::serve(
                config,
                ServeOptions {
                    bind,
                    port: cli.port,
                },
            )
            .await
        }
        Some(Commands::Client(command)) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), LogFormat::Text)?;
            let port = cli.port.unwrap_or(daemon::DEFAULT_PORT);
            match command {
                ClientCommand::Agent { command } => commands::agent::handle_command(command, &cli.host, port).await,
                ClientCommand::Send(args) => commands::message::send(args, &cli.host, port).await,
                ClientCommand::Message { command } => {
                    commands::message::handle_command(command, &cli.host, port).await
                }
                ClientCommand::Metrics { json } => commands::metrics::show(json, &cli.host, port).await,
                ClientCommand::Config { command } => commands::config::handle_command(command, cli.config).await,
            }
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Json => builder.json().with_target(true).init(),
        LogFormat::Text => builder.with_target(false).compact().init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_default_port_is_kept_for_serve() {
        let cli = Cli::try_parse_from(["agentmesh", "serve", "--port", "8700"]).unwrap();
        assert_eq!(cli.port, Some(daemon::DEFAULT_PORT));
        assert!(matches!(cli.command, Some(Commands::Serve { .. })));
    }

    #[test]
    fn test_port_is_unset_without_flag() {
        std::env::remove_var("AGENTMESH_PORT");
        let cli = Cli::try_parse_from(["agentmesh", "metrics"]).unwrap();
        assert_eq!(cli.port, None);
    }
}
