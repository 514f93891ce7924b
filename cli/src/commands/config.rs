// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use agentmesh_core::domain::mesh_config::MeshConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./agentmesh-config.yaml)
        #[arg(short, long, default_value = "./agentmesh-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(&output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = MeshConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. AGENTMESH_CONFIG_PATH: {}",
            std::env::var("AGENTMESH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./agentmesh-config.yaml");
        println!("  4. ~/.agentmesh/config.yaml");
        println!("  5. /etc/agentmesh/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node Identity:".bold());
    println!("  ID: {}", spec.node.id);
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Health:".bold());
    println!("  Check interval: {:?}", spec.health.check_interval);
    println!("  Heartbeat timeout: {:?}", spec.health.heartbeat_timeout);
    println!("  Retention window: {:?}", spec.health.retention_window);
    println!();

    println!("{}", "Routing:".bold());
    println!("  Max route attempts: {}", spec.routing.max_route_attempts);
    println!(
        "  Backoff: {:?} base, {:?} max",
        spec.routing.backoff_base, spec.routing.backoff_max
    );
    println!("  Handoff timeout: {:?}", spec.routing.handoff_timeout);
    println!("  Route deadline: {:?}", spec.routing.route_deadline);
    println!("  Ack timeout: {:?}", spec.routing.ack_timeout);
    println!();

    println!("{}", "Network:".bold());
    println!("  API: {}:{}", spec.network.bind_address, spec.network.port);
    let metrics = &spec.observability.metrics;
    if metrics.enabled {
        println!("  Prometheus: {}:{}", spec.network.bind_address, metrics.port);
    } else {
        println!("  Prometheus: {}", "(disabled)".dimmed());
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = MeshConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    MeshConfigManifest::default()
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentmesh-config.yaml");

        generate(&path, false).unwrap();
        assert!(generate(&path, false).is_err());
        generate(&path, true).unwrap();

        validate(Some(path)).unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate(Some(dir.path().join("missing.yaml"))).is_err());
    }
}
