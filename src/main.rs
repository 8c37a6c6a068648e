// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use rove_bridge::{Bridge, BridgeConfig, HttpAgentClient};
use rove_supervisor::{Supervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Bridge {
            sandbox_id,
            session_id,
            control_plane,
            token,
            opencode_port,
        } => {
            let cfg = BridgeConfig {
                sandbox_id,
                session_id,
                control_plane_url: control_plane,
                token,
                agent_port: opencode_port,
            };
            let agent = Arc::new(HttpAgentClient::new(cfg.agent_base_url())?);
            let bridge = Bridge::new(cfg, agent);
            bridge.run().await
        }

        Commands::Supervisor => {
            let cfg = SupervisorConfig::from_env();
            Supervisor::new(cfg).run().await
        }
    }
}

/// Structured logs to stderr; `RUST_LOG` overrides the default `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
