// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! One-shot repository setup script.
//!
//! Cold-started sandboxes run `.openinspect/setup.sh` from the cloned repo
//! once, before the agent server starts. The script is user-supplied and
//! untrusted in the scheduling sense: it gets a bounded wall-clock budget
//! and its output is captured, but a failure never blocks the sandbox.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{SupervisorConfig, SETUP_SCRIPT_PATH};

const OUTPUT_TAIL_LINES: usize = 50;

fn spawn_line_collector(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(line);
        }
        lines
    })
}

async fn collected_tail(handle: JoinHandle<Vec<String>>) -> String {
    let lines = handle.await.unwrap_or_default();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

/// Run the setup script if the repo provides one.
///
/// Returns `true` when the script succeeded or was absent.
pub async fn run_setup_script(cfg: &SupervisorConfig) -> bool {
    let script = cfg.repo_path().join(SETUP_SCRIPT_PATH);
    if !script.exists() {
        debug!(script = %script.display(), "no setup script");
        return true;
    }

    info!(
        script = %script.display(),
        timeout_secs = cfg.setup_timeout.as_secs(),
        "running setup script"
    );

    let mut child = match Command::new("bash")
        .arg(&script)
        .current_dir(cfg.repo_path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!(script = %script.display(), "setup script failed to start: {e}");
            return false;
        }
    };

    // Drain both pipes while waiting so a chatty script cannot block on a
    // full pipe buffer.
    let stdout_tail = child.stdout.take().map(spawn_line_collector);
    let stderr_tail = child.stderr.take().map(spawn_line_collector);

    let status = match tokio::time::timeout(cfg.setup_timeout, child.wait()).await {
        Err(_) => {
            let _ = child.kill().await;
            let tail = match stdout_tail {
                Some(handle) => collected_tail(handle).await,
                None => String::new(),
            };
            error!(
                timeout_secs = cfg.setup_timeout.as_secs(),
                output_tail = %tail,
                script = %script.display(),
                "setup script timed out"
            );
            return false;
        }
        Ok(Err(e)) => {
            error!(script = %script.display(), "setup script wait failed: {e}");
            return false;
        }
        Ok(Ok(status)) => status,
    };

    let mut tail = String::new();
    if let Some(handle) = stdout_tail {
        tail = collected_tail(handle).await;
    }
    if let Some(handle) = stderr_tail {
        let err_tail = collected_tail(handle).await;
        if !err_tail.is_empty() {
            if !tail.is_empty() {
                tail.push('\n');
            }
            tail.push_str(&err_tail);
        }
    }

    if status.success() {
        debug!(exit_code = 0, output_tail = %tail, "setup script complete");
        true
    } else {
        error!(
            exit_code = status.code().unwrap_or(-1),
            output_tail = %tail,
            script = %script.display(),
            "setup script failed"
        );
        false
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
