// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// Sandbox-side processes for remote coding sessions.
#[derive(Parser, Debug)]
#[command(name = "rove", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent bridge: link the local agent server to the control
    /// plane over the session channel.
    ///
    /// Exits 0 on graceful termination (shutdown command or a terminal
    /// rejection from the control plane); any crash exits non-zero so the
    /// supervisor restarts it.
    Bridge {
        /// Sandbox identifier, sent with every event.
        #[arg(long)]
        sandbox_id: String,
        /// Control-plane session this sandbox serves.
        #[arg(long)]
        session_id: String,
        /// Control plane base URL (http(s)://...).
        #[arg(long)]
        control_plane: String,
        /// Bearer token for the session channel.
        #[arg(long)]
        token: String,
        /// Port the local agent server listens on.
        #[arg(long, default_value_t = 4096)]
        opencode_port: u16,
    },

    /// Run the sandbox supervisor (PID 1): git sync, setup script, agent
    /// server and bridge lifecycle. Configured entirely from environment
    /// variables injected by the scheduler.
    Supervisor,
}
