// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bridge identity and tunables.
//!
//! The identity comes from process arguments (the supervisor passes them
//! through); the SSE inactivity timeout is the one knob operators can turn
//! via the environment, clamped to a sane range.

use std::time::Duration;

use tracing::{info, warn};

/// How often a `heartbeat` event is written to an open link.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Protocol-level keepalive ping cadence on the link.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// How long past a ping the peer may stay silent before the link is dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Cap on the exponential reconnect backoff.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// TCP connect timeout for agent HTTP calls.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for agent REST calls (the SSE stream is exempt).
pub const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding the SSE inactivity timeout, in seconds.
pub const SSE_INACTIVITY_ENV: &str = "BRIDGE_SSE_INACTIVITY_TIMEOUT";
pub const SSE_INACTIVITY_DEFAULT_SECS: f64 = 120.0;
pub const SSE_INACTIVITY_MIN_SECS: f64 = 5.0;
pub const SSE_INACTIVITY_MAX_SECS: f64 = 3600.0;

/// Wall-clock ceiling for one prompt, measured from the prompt request.
pub const PROMPT_MAX_DURATION: Duration = Duration::from_secs(5400);
/// Cap on buffered part events awaiting assistant-message admission.
pub const MAX_PENDING_PART_EVENTS: usize = 2000;

/// Identity of one bridge process; immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub sandbox_id: String,
    pub session_id: String,
    pub control_plane_url: String,
    pub token: String,
    pub agent_port: u16,
}

impl BridgeConfig {
    /// WebSocket URL for the control-plane session channel.
    pub fn ws_url(&self) -> String {
        let base = self
            .control_plane_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/sessions/{}/ws?type=sandbox", self.session_id)
    }

    /// Base URL of the local agent server.
    pub fn agent_base_url(&self) -> String {
        format!("http://localhost:{}", self.agent_port)
    }
}

/// Resolve the SSE inactivity timeout from the environment.
pub fn sse_inactivity_timeout() -> Duration {
    let raw = std::env::var(SSE_INACTIVITY_ENV).ok();
    let secs = resolve_timeout_secs(
        SSE_INACTIVITY_ENV,
        raw.as_deref(),
        SSE_INACTIVITY_DEFAULT_SECS,
        SSE_INACTIVITY_MIN_SECS,
        SSE_INACTIVITY_MAX_SECS,
    );
    Duration::from_secs_f64(secs)
}

/// Parse and clamp a timeout value in seconds.
///
/// Invalid input falls back to the default; out-of-range values are clamped
/// to the nearest bound. Every resolution is logged so a misconfigured
/// sandbox is diagnosable from its output alone.
pub fn resolve_timeout_secs(
    name: &str,
    raw: Option<&str>,
    default: f64,
    min_value: f64,
    max_value: f64,
) -> f64 {
    let mut value = match raw {
        None | Some("") => default,
        Some(text) => match text.parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    timeout_name = name,
                    raw = text,
                    default_secs = default,
                    "invalid timeout value; using default"
                );
                default
            }
        },
    };

    if value < min_value {
        warn!(
            timeout_name = name,
            min_secs = min_value,
            "timeout below minimum; clamped"
        );
        value = min_value;
    } else if value > max_value {
        warn!(
            timeout_name = name,
            max_secs = max_value,
            "timeout above maximum; clamped"
        );
        value = max_value;
    }

    info!(
        timeout_name = name,
        timeout_secs = value,
        min_secs = min_value,
        max_secs = max_value,
        "timeout configured"
    );
    value
}

// ── Unit tests ────────────────────────────────────────────────────────────────
