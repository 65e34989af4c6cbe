// SPDX-License-Identifier: Apache-2.0
//!
//! Binary entry point: config loading, tracing setup, wiring the gateway and
//! its kernel, and graceful shutdown on SIGTERM/SIGINT.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use cli::{Cli, Command};
use conclave_gateway::{Gateway, GatewayConfig};
use conclave_kernel::KernelConfig;
use conclave_registry::PeerRecord;
use conclave_tsp::TspAdapter;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let orchestrator_config =
        config::load(cli.config.as_deref()).context("loading orchestrator configuration")?;

    init_logging(&orchestrator_config.log_level, cli.verbose);

    match cli.command.unwrap_or(Command::Serve) {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&orchestrator_config)?);
            return Ok(());
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            return Ok(());
        }
        Command::Serve => {}
    }

    let gateway = build_gateway(&orchestrator_config).await;

    let shutdown_gateway = gateway.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("conclave: shutdown signal received");
        shutdown_gateway.shutdown().await;
    });

    info!(
        agent_bind = %orchestrator_config.agent_bind,
        client_bind = %orchestrator_config.client_bind,
        service_bind = %orchestrator_config.service_bind,
        "conclave: starting orchestrator"
    );
    gateway.run().await.context("gateway serve loop")?;
    info!("conclave: shutdown complete");
    Ok(())
}

/// Builds the gateway/kernel and preloads directory entries and tool servers
/// named in config. Live peers that later register under the same name
/// offline these placeholders per the registries' name-collision rule.
async fn build_gateway(orchestrator_config: &config::OrchestratorConfig) -> Arc<Gateway> {
    let gateway_config = GatewayConfig {
        agent_bind: orchestrator_config.agent_bind.clone(),
        client_bind: orchestrator_config.client_bind.clone(),
        service_bind: orchestrator_config.service_bind.clone(),
    };
    let kernel_config = KernelConfig {
        default_timeout: orchestrator_config.default_timeout(),
        tool_timeout: orchestrator_config.tool_timeout(),
    };
    let gateway = Gateway::new(gateway_config, kernel_config);
    let kernel = gateway.kernel();

    for (name, peer) in &orchestrator_config.preconfigured_agents {
        kernel
            .agents
            .register(preconfigured_record(conclave_ids::AgentId::new(), name, peer))
            .await;
    }
    for (name, peer) in &orchestrator_config.preconfigured_services {
        kernel
            .services
            .register(preconfigured_record(conclave_ids::ServiceId::new(), name, peer))
            .await;
    }
    register_tool_servers(&kernel.tsp, &orchestrator_config.tool_servers).await;

    gateway
}

/// A directory entry with no live connection: built with a throwaway
/// connection id, then immediately detached so it reads as `offline` until a
/// real peer registers under the same name.
fn preconfigured_record<Id: Clone>(id: Id, name: &str, peer: &config::PreconfiguredPeer) -> PeerRecord<Id> {
    let mut record = PeerRecord::new(id, name, conclave_ids::ConnectionId::new())
        .with_capabilities(peer.capabilities.clone())
        .with_manifest(peer.manifest.clone());
    record.status = conclave_registry::PeerStatus::Offline;
    record.connection_id = None;
    record
}

async fn register_tool_servers(
    tsp: &TspAdapter,
    tool_servers: &std::collections::HashMap<String, conclave_tsp::LaunchSpec>,
) {
    for (name, spec) in tool_servers {
        tsp.register(name.clone(), spec.clone()).await;
    }
}

/// Raises the configured level when `-v`/`-vv` is passed. An explicit
/// `RUST_LOG` always wins over both the config file and the flag.
fn init_logging(configured_level: &str, verbosity: u8) {
    let level = match verbosity {
        0 => configured_level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .is_err()
    {
        warn!("tracing subscriber already initialized");
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
