// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Git preparation for the three ways a sandbox comes up:
//!
//! - cold start / image build: clone (shallow), fetch, rebase
//! - repo image: fetch the base branch, hard-reset to it
//! - snapshot restore: quiet fetch, report how far behind the remote we are
//!
//! Failures are logged and reported as a boolean; the sandbox still boots so
//! the operator can intervene through the agent instead of staring at a
//! crash loop.

use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{StartMode, SupervisorConfig};

async fn run_git(cwd: &Path, args: &[&str]) -> std::io::Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Refresh the origin URL so fetches use the freshest clone token.
async fn refresh_remote_url(cfg: &SupervisorConfig, repo: &Path) {
    if cfg.vcs_clone_token.is_empty() {
        return;
    }
    match run_git(repo, &["remote", "set-url", "origin", &cfg.repo_url(true)]).await {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            exit_code = output.status.code().unwrap_or(-1),
            "git remote set-url failed"
        ),
        Err(e) => warn!("git remote set-url failed: {e}"),
    }
}

/// Full sync for cold starts: clone if needed, then fetch + rebase onto the
/// base branch. Returns whether the repo ended up in sync.
pub async fn full_sync(cfg: &SupervisorConfig) -> bool {
    let repo = cfg.repo_path();
    debug!(
        repo_owner = %cfg.repo_owner,
        repo_name = %cfg.repo_name,
        repo_path = %repo.display(),
        has_clone_token = !cfg.vcs_clone_token.is_empty(),
        "git sync starting"
    );

    if !repo.exists() {
        if !cfg.has_repo() {
            info!("no repository configured; skipping clone");
            return true;
        }

        info!(
            repo_owner = %cfg.repo_owner,
            repo_name = %cfg.repo_name,
            authenticated = !cfg.vcs_clone_token.is_empty(),
            "cloning repository"
        );

        // Image builds keep some history so snapshot consumers can rebase;
        // interactive sandboxes only need the tip.
        let depth = if cfg.mode == StartMode::ImageBuild {
            "100"
        } else {
            "1"
        };
        let repo_arg = repo.to_string_lossy().to_string();
        let clone = run_git(
            &cfg.workspace,
            &[
                "clone",
                "--depth",
                depth,
                "--branch",
                cfg.session.base_branch(),
                &cfg.repo_url(true),
                &repo_arg,
            ],
        )
        .await;

        match clone {
            Ok(output) if output.status.success() => {
                info!(repo_path = %repo.display(), "clone complete");
            }
            Ok(output) => {
                error!(
                    exit_code = output.status.code().unwrap_or(-1),
                    stderr = %stderr_of(&output),
                    "clone failed"
                );
                return false;
            }
            Err(e) => {
                error!("clone failed: {e}");
                return false;
            }
        }
    }

    refresh_remote_url(cfg, &repo).await;

    let base = cfg.session.base_branch();
    match run_git(&repo, &["fetch", "origin", base]).await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            error!(
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr_of(&output),
                "fetch failed"
            );
            return false;
        }
        Err(e) => {
            error!("fetch failed: {e}");
            return false;
        }
    }

    let upstream = format!("origin/{base}");
    match run_git(&repo, &["rebase", &upstream]).await {
        Ok(output) if output.status.success() => {}
        Ok(_) | Err(_) => {
            // Only abort when a rebase is actually in progress; `rebase
            // --abort` on a clean tree fails loudly.
            let in_progress = repo.join(".git/rebase-merge").exists()
                || repo.join(".git/rebase-apply").exists();
            if in_progress {
                let _ = run_git(&repo, &["rebase", "--abort"]).await;
            }
            warn!(base_branch = base, "rebase failed; staying on current HEAD");
        }
    }

    match run_git(&repo, &["rev-parse", "HEAD"]).await {
        Ok(output) if output.status.success() => {
            let head_sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!(head_sha = %head_sha, "git sync complete");
        }
        _ => warn!("could not resolve HEAD after sync"),
    }

    true
}

/// Fast path for repo-image starts: the clone exists from the image build,
/// only the drift since then needs to be pulled in.
pub async fn incremental_sync(cfg: &SupervisorConfig) -> bool {
    let repo = cfg.repo_path();
    if !repo.exists() {
        warn!(repo_path = %repo.display(), "incremental sync skipped: no repository");
        return false;
    }

    refresh_remote_url(cfg, &repo).await;

    let base = cfg.session.base_branch();
    match run_git(&repo, &["fetch", "origin", base]).await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            error!(
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr_of(&output),
                "incremental fetch failed"
            );
            return false;
        }
        Err(e) => {
            error!("incremental fetch failed: {e}");
            return false;
        }
    }

    let target = format!("origin/{base}");
    match run_git(&repo, &["reset", "--hard", &target]).await {
        Ok(output) if output.status.success() => {}
        Ok(output) => error!(
            exit_code = output.status.code().unwrap_or(-1),
            stderr = %stderr_of(&output),
            "incremental reset failed"
        ),
        Err(e) => error!("incremental reset failed: {e}"),
    }

    info!("incremental git sync complete");
    true
}

/// After a snapshot restore the workspace already holds all changes; just
/// check how far the remote has moved, for observability.
pub async fn quick_fetch(cfg: &SupervisorConfig) {
    let repo = cfg.repo_path();
    if !repo.exists() {
        info!(repo_path = %repo.display(), "quick fetch skipped: no repository");
        return;
    }

    refresh_remote_url(cfg, &repo).await;

    match run_git(&repo, &["fetch", "--quiet", "origin"]).await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr_of(&output),
                "quick fetch failed"
            );
            return;
        }
        Err(e) => {
            warn!("quick fetch failed: {e}");
            return;
        }
    }

    let branch = match run_git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => return,
    };

    let range = format!("HEAD..origin/{branch}");
    match run_git(&repo, &["rev-list", "--count", &range]).await {
        Ok(output) if output.status.success() => {
            let commits_behind: u64 = String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0);
            info!(commits_behind, current_branch = %branch, "snapshot drift");
        }
        _ => debug!("snapshot drift unknown: no upstream for current branch"),
    }
}
