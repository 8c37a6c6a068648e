// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persistence for the agent session id.
//!
//! One text file at a fixed temp path survives bridge restarts, so a
//! restarted bridge resumes the same agent conversation instead of starting
//! a fresh one. The bridge is the only writer; writes go through a temp
//! file and rename so readers never observe a partial id.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The well-known location used inside the sandbox.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join("opencode-session-id")
    }

    /// Read the persisted session id, if any.
    pub fn load(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let id = text.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Persist a session id atomically (temp file + rename).
    pub fn save(&self, id: &str) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, id)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
