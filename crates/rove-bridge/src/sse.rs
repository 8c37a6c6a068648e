// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Framing for the agent's Server-Sent-Events stream.
//!
//! Wire format:
//!
//! ```text
//! data: {"type": "...", "properties": {...}}
//!
//! data: {"type": "...", "properties": {...}}
//! ```
//!
//! Events are separated by a blank line. A frame may carry several `data:`
//! lines; they join with `\n` before JSON parsing. Frames can be split
//! across TCP chunks, so a remainder buffer is carried forward and only
//! complete frames are parsed.

use anyhow::Result;
use futures::{future, Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

/// Turn a byte-chunk stream into a stream of parsed SSE event payloads.
///
/// A chunk-level read error ends the stream with one `Err`; a JSON parse
/// failure of a single frame is logged and the frame is skipped.
pub fn event_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<Value>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    bytes
        .scan(String::new(), |buf, chunk| {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    return future::ready(Some(vec![Err(
                        anyhow::Error::new(e).context("SSE read error")
                    )]));
                }
            };
            buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));

            let mut events = Vec::new();
            while let Some(pos) = buf.find("\n\n") {
                let frame = buf[..pos].to_string();
                buf.drain(..pos + 2);
                if let Some(event) = parse_frame(&frame) {
                    events.push(Ok(event));
                }
            }
            future::ready(Some(events))
        })
        .flat_map(futures::stream::iter)
}

/// Extract and parse the `data:` payload of one SSE frame.
fn parse_frame(frame: &str) -> Option<Value> {
    let mut data_lines: Vec<&str> = Vec::new();
    for line in frame.split('\n') {
        let line = line.trim_end_matches('\r');
        // Both "data: {...}" and "data:{...}" appear in the wild.
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.trim_start();
            if !rest.is_empty() {
                data_lines.push(rest);
            }
        }
    }
    if data_lines.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(&data_lines.join("\n")) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("SSE frame parse error: {e}");
            None
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
