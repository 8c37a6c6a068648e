// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Sandbox supervisor — PID 1 inside each sandbox.
//!
//! # Startup sequence
//!
//! 1. Git preparation for the detected start mode (see `git`).
//! 2. One-shot setup script (cold starts only).
//! 3. Image-build mode stops here: signal completion, wait to be
//!    snapshotted externally.
//! 4. Start the agent server; poll its health endpoint up to 30 s.
//! 5. Start the bridge (own binary, `bridge` subcommand).
//! 6. Monitor both children; restart with bounded exponential backoff.
//!
//! A bridge exit with code 0 is intentional (shutdown command or fatal link
//! rejection) and shuts the sandbox down rather than restarting. Exceeding
//! a restart budget reports a fatal error to the control plane and exits.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    backoff_delay, StartMode, SupervisorConfig, HEALTH_CHECK_TIMEOUT, MAX_RESTARTS,
    OPENCODE_PORT,
};
use crate::{git, setup};

pub struct Supervisor {
    cfg: SupervisorConfig,
    agent: Option<Child>,
    bridge: Option<Child>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self {
            cfg,
            agent: None,
            bridge: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the sandbox to completion. Fatal errors are reported upstream;
    /// children are always torn down before returning.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            error!("supervisor error: {e:#}");
            report_fatal(&self.cfg, &format!("{e:#}")).await;
        }
        self.shutdown_children().await;
        Ok(())
    }

    async fn run_inner(&mut self) -> Result<()> {
        let startup = Instant::now();
        info!(
            repo_owner = %self.cfg.repo_owner,
            repo_name = %self.cfg.repo_name,
            mode = ?self.cfg.mode,
            "supervisor starting"
        );
        if self.cfg.mode == StartMode::RepoImage {
            info!(
                build_sha = self.cfg.repo_image_sha.as_deref().unwrap_or("unknown"),
                "booting from repo image"
            );
        }

        self.spawn_signal_handlers();

        // Phase 1: git preparation.
        let git_sync_success = match self.cfg.mode {
            StartMode::Snapshot => {
                git::quick_fetch(&self.cfg).await;
                true
            }
            StartMode::RepoImage => git::incremental_sync(&self.cfg).await,
            StartMode::Cold | StartMode::ImageBuild => git::full_sync(&self.cfg).await,
        };

        // Phase 2: one-shot setup (not for restored workspaces).
        let mut setup_success = None;
        if matches!(self.cfg.mode, StartMode::Cold | StartMode::ImageBuild) {
            setup_success = Some(setup::run_setup_script(&self.cfg).await);
        }

        // Image builds stop here: the builder watches for this line, then
        // snapshots the running sandbox and terminates us.
        if self.cfg.mode == StartMode::ImageBuild {
            info!(
                duration_ms = startup.elapsed().as_millis() as u64,
                "image build complete; waiting for snapshot"
            );
            self.shutdown.cancelled().await;
            return Ok(());
        }

        // Phases 3-4: children.
        self.start_agent().await?;
        self.start_bridge().await?;

        info!(
            repo_owner = %self.cfg.repo_owner,
            repo_name = %self.cfg.repo_name,
            mode = ?self.cfg.mode,
            git_sync_success,
            setup_success = ?setup_success,
            duration_ms = startup.elapsed().as_millis() as u64,
            "sandbox startup complete"
        );

        // Phase 5: supervision.
        self.monitor().await
    }

    fn spawn_signal_handlers(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ] {
            match signal(kind) {
                Ok(mut sig) => {
                    let token = self.shutdown.clone();
                    tokio::spawn(async move {
                        sig.recv().await;
                        info!(signal_name = name, "shutdown signal");
                        token.cancel();
                    });
                }
                Err(e) => warn!(signal_name = name, "could not install handler: {e}"),
            }
        }
    }

    // ── Agent server ──────────────────────────────────────────────────────────

    async fn start_agent(&mut self) -> Result<()> {
        info!("starting agent server");

        // Run in the repo when one was cloned; the bare workspace otherwise.
        let repo = self.cfg.repo_path();
        let workdir = if repo.join(".git").exists() {
            repo
        } else {
            self.cfg.workspace.clone()
        };

        let agent_config = json!({
            "model": format!("{}/{}", self.cfg.session.provider(), self.cfg.session.model()),
            "permission": { "*": { "*": "allow" } },
        });

        let mut child = Command::new("opencode")
            .args([
                "serve",
                "--port",
                &OPENCODE_PORT.to_string(),
                "--hostname",
                "0.0.0.0",
                "--print-logs",
            ])
            .current_dir(&workdir)
            .env("OPENCODE_CONFIG_CONTENT", agent_config.to_string())
            // The agent's interactive question tool blocks on input the
            // bridge has no channel to relay; serve mode disables it.
            .env("OPENCODE_CLIENT", "serve")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning agent server")?;

        forward_child_output(&mut child, Some("opencode"));
        self.agent = Some(child);

        self.wait_for_health().await?;
        info!("agent server ready");
        Ok(())
    }

    async fn wait_for_health(&self) -> Result<()> {
        let url = format!("http://localhost:{OPENCODE_PORT}/global/health");
        let client = reqwest::Client::new();
        let start = Instant::now();

        while start.elapsed() < HEALTH_CHECK_TIMEOUT {
            if self.shutdown.is_cancelled() {
                bail!("shutdown requested during startup");
            }
            match client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!("health check: {e}"),
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        bail!("agent server failed to become healthy")
    }

    // ── Bridge ────────────────────────────────────────────────────────────────

    async fn start_bridge(&mut self) -> Result<()> {
        if self.cfg.control_plane_url.is_empty() {
            info!("bridge skipped: no control plane URL");
            return Ok(());
        }
        if self.cfg.session.session_id.is_empty() {
            info!("bridge skipped: no session id");
            return Ok(());
        }

        info!("starting bridge");
        let exe = std::env::current_exe().context("locating own executable")?;
        let mut child = Command::new(exe)
            .args([
                "bridge",
                "--sandbox-id",
                &self.cfg.sandbox_id,
                "--session-id",
                &self.cfg.session.session_id,
                "--control-plane",
                &self.cfg.control_plane_url,
                "--token",
                &self.cfg.sandbox_token,
                "--opencode-port",
                &OPENCODE_PORT.to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning bridge")?;

        // The bridge logs with its own fields; no prefix needed.
        forward_child_output(&mut child, None);

        // Surface immediate startup failures right away instead of waiting
        // for the monitor's next tick.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let exit_code = status.code().unwrap_or(-1);
            if exit_code == 0 {
                warn!(exit_code, "bridge exited immediately after start");
            } else {
                error!(exit_code, "bridge crashed during startup");
            }
        }

        self.bridge = Some(child);
        Ok(())
    }

    // ── Monitoring ────────────────────────────────────────────────────────────

    async fn monitor(&mut self) -> Result<()> {
        let mut agent_restarts = 0u32;
        let mut bridge_restarts = 0u32;

        while !self.shutdown.is_cancelled() {
            if let Some(child) = self.agent.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let exit_code = status.code().unwrap_or(-1);
                    agent_restarts += 1;
                    error!(
                        exit_code,
                        restart_count = agent_restarts,
                        "agent server exited"
                    );

                    if agent_restarts > MAX_RESTARTS {
                        report_fatal(
                            &self.cfg,
                            &format!("Agent server crashed {agent_restarts} times, giving up"),
                        )
                        .await;
                        self.shutdown.cancel();
                        break;
                    }

                    let delay = backoff_delay(agent_restarts);
                    info!(
                        delay_s = delay.as_secs_f64(),
                        restart_count = agent_restarts,
                        "restarting agent server"
                    );
                    tokio::time::sleep(delay).await;
                    self.start_agent().await?;
                }
            }

            if let Some(child) = self.bridge.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let exit_code = status.code().unwrap_or(-1);

                    if exit_code == 0 {
                        // Graceful: shutdown command or fatal link rejection.
                        info!("bridge exited cleanly; shutting down sandbox");
                        self.shutdown.cancel();
                        break;
                    }

                    bridge_restarts += 1;
                    error!(
                        exit_code,
                        restart_count = bridge_restarts,
                        "bridge crashed"
                    );

                    if bridge_restarts > MAX_RESTARTS {
                        report_fatal(
                            &self.cfg,
                            &format!("Bridge crashed {bridge_restarts} times, giving up"),
                        )
                        .await;
                        self.shutdown.cancel();
                        break;
                    }

                    let delay = backoff_delay(bridge_restarts);
                    info!(
                        delay_s = delay.as_secs_f64(),
                        restart_count = bridge_restarts,
                        "restarting bridge"
                    );
                    tokio::time::sleep(delay).await;
                    self.start_bridge().await?;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    async fn shutdown_children(&mut self) {
        info!("supervisor shutdown starting");

        if let Some(mut child) = self.bridge.take() {
            terminate_child(&mut child, Duration::from_secs(5), "bridge").await;
        }
        if let Some(mut child) = self.agent.take() {
            terminate_child(&mut child, Duration::from_secs(10), "agent server").await;
        }

        info!("supervisor shutdown complete");
    }
}

/// SIGTERM with a grace period, then SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration, name: &str) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(child = name, "ignored SIGTERM; killing");
        let _ = child.kill().await;
    }
}

/// Forward a child's stdout/stderr line-by-line to our stdout, optionally
/// tagged so interleaved output stays attributable.
fn forward_child_output(child: &mut Child, prefix: Option<&'static str>) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match prefix {
                    Some(tag) => println!("[{tag}] {line}"),
                    None => println!("{line}"),
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match prefix {
                    Some(tag) => println!("[{tag}] {line}"),
                    None => println!("{line}"),
                }
            }
        });
    }
}

/// Tell the control plane this sandbox is giving up.
pub async fn report_fatal(cfg: &SupervisorConfig, message: &str) {
    error!(detail = message, "fatal sandbox error");

    if cfg.control_plane_url.is_empty() {
        return;
    }

    let url = format!(
        "{}/sandbox/{}/error",
        cfg.control_plane_url, cfg.sandbox_id
    );
    let result = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "error": message, "fatal": true }))
        .bearer_auth(&cfg.sandbox_token)
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    if let Err(e) = result {
        error!("failed to report fatal error: {e}");
    }
}
