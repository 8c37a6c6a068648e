// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors with meaning beyond their message text.
///
/// Most bridge failures propagate as `anyhow::Error`; the variants here are
/// the ones callers match on — the link loop downcasts to decide between
/// reconnecting and exiting, and the prompt path distinguishes its two
/// timeout flavours.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The control plane rejected the session with a status that retrying
    /// cannot fix (unauthorized, forbidden, not-found, gone). The bridge
    /// exits cleanly and lets the supervisor propagate the shutdown.
    #[error("session rejected by control plane (HTTP {0})")]
    SessionTerminated(u16),

    #[error("SSE connection failed: {0}")]
    SseConnection(u16),

    #[error("async prompt failed: {status} - {body}")]
    PromptRequest { status: u16, body: String },

    #[error(
        "SSE stream inactive for {timeout_secs:.0}s (no data received). \
         Total elapsed: {elapsed_secs:.0}s"
    )]
    SseInactivityTimeout { timeout_secs: f64, elapsed_secs: f64 },

    #[error("Prompt exceeded max duration of {0:.0}s.")]
    PromptMaxDuration(f64),
}
