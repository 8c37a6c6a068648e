// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Prompt session: one request/response cycle through the bridge.
//!
//! The agent multiplexes every session's activity onto a single SSE stream,
//! so attributing parts to *this* prompt is the central problem here. The
//! scheme:
//!
//! 1. Generate an ascending user-message ID and submit it with the prompt.
//!    Assistant messages created for it carry that ID as their `parentID`.
//! 2. A `message.updated` whose parent matches **admits** the assistant
//!    message id; parts are only processed for admitted ids.
//! 3. Parts that arrive before their message's admission are buffered
//!    (bounded) and flushed in order on admission.
//! 4. `session.idle` ends the prompt; a final fetch of the message list
//!    tops up any text the stream lost near termination.
//!
//! Events sent upstream always carry the control plane's message id, never
//! the agent's internal ids.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use rove_protocol::{split_model_spec, Event};

use crate::agent::AgentApi;
use crate::config::{MAX_PENDING_PART_EVENTS, PROMPT_MAX_DURATION};
use crate::ident::{ascending, IdPrefix};
use crate::link::EventSender;

pub struct PromptSession {
    /// Control-plane message id; stamped on every event we emit.
    message_id: String,
    /// Our ascending user-message id; assistant replies reference it.
    agent_message_id: String,
    /// Full text sent so far, keyed by part id. Emissions are cumulative,
    /// so per-part text length never decreases.
    cumulative_text: HashMap<String, String>,
    /// `tool:<callID>:<status>` keys already emitted.
    emitted_tool_states: HashSet<String>,
    /// Assistant message ids admitted by parent-ID match.
    allowed_assistant_msg_ids: HashSet<String>,
    /// Parts seen before their message was admitted, in arrival order.
    pending_parts: HashMap<String, Vec<(Value, Option<String>)>>,
    pending_total: usize,
    drop_logged: bool,
    inactivity: Duration,
    max_duration: Duration,
}

impl PromptSession {
    pub fn new(message_id: impl Into<String>, inactivity: Duration) -> Self {
        Self {
            message_id: message_id.into(),
            agent_message_id: ascending(IdPrefix::Message),
            cumulative_text: HashMap::new(),
            emitted_tool_states: HashSet::new(),
            allowed_assistant_msg_ids: HashSet::new(),
            pending_parts: HashMap::new(),
            pending_total: 0,
            drop_logged: false,
            inactivity,
            max_duration: PROMPT_MAX_DURATION,
        }
    }

    /// Override the absolute prompt deadline (defaults to 90 minutes).
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn agent_message_id(&self) -> &str {
        &self.agent_message_id
    }

    /// Body for the agent's async prompt endpoint.
    pub fn request_body(&self, content: &str, model: Option<&str>) -> Value {
        let mut body = json!({
            "parts": [{ "type": "text", "text": content }],
            "messageID": self.agent_message_id,
        });
        if let Some(spec) = model {
            let (provider_id, model_id) = split_model_spec(spec);
            body["model"] = json!({
                "providerID": provider_id,
                "modelID": model_id,
            });
        }
        body
    }

    /// Drive one prompt to completion, emitting events as they happen.
    ///
    /// Returns `Ok` when the session went idle; any error return means the
    /// prompt failed and the caller owes a failed `execution_complete`.
    pub async fn run(
        &mut self,
        agent: &dyn AgentApi,
        agent_session_id: &str,
        events: &EventSender,
        content: &str,
        model: Option<&str>,
    ) -> Result<()> {
        let start = Instant::now();

        // Subscribe before submitting so no early event can be missed.
        let mut stream = agent.subscribe_events().await?;

        let body = self.request_body(content, model);
        agent
            .prompt_async(agent_session_id, &body)
            .await
            .context("submitting prompt")?;
        let prompt_deadline = Instant::now() + self.max_duration;

        let mut inactivity_deadline = tokio::time::Instant::now() + self.inactivity;

        loop {
            let item = match tokio::time::timeout_at(inactivity_deadline, stream.next()).await {
                Err(_) => {
                    let elapsed = start.elapsed();
                    error!(
                        message_id = %self.message_id,
                        timeout_secs = self.inactivity.as_secs_f64(),
                        elapsed_secs = elapsed.as_secs_f64(),
                        "SSE stream inactive; abandoning prompt"
                    );
                    self.stop_agent(agent, agent_session_id, "inactivity_timeout")
                        .await;
                    self.fetch_final_message_state(agent, agent_session_id, events)
                        .await;
                    return Err(crate::BridgeError::SseInactivityTimeout {
                        timeout_secs: self.inactivity.as_secs_f64(),
                        elapsed_secs: elapsed.as_secs_f64(),
                    }
                    .into());
                }
                Ok(None) => bail!("SSE stream closed before the session went idle"),
                Ok(Some(item)) => item,
            };
            // Reset-on-data deadline: steady progress never times out.
            inactivity_deadline = tokio::time::Instant::now() + self.inactivity;

            let event = item.context("SSE read error")?;
            if self.translate(&event, agent, agent_session_id, events).await? {
                return Ok(());
            }

            if Instant::now() > prompt_deadline {
                error!(
                    message_id = %self.message_id,
                    max_duration_secs = self.max_duration.as_secs_f64(),
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    "prompt exceeded max duration; abandoning"
                );
                self.stop_agent(agent, agent_session_id, "prompt_max_duration_timeout")
                    .await;
                self.fetch_final_message_state(agent, agent_session_id, events)
                    .await;
                return Err(
                    crate::BridgeError::PromptMaxDuration(self.max_duration.as_secs_f64()).into(),
                );
            }
        }
    }

    /// Process one SSE event. Returns `Ok(true)` when the prompt is done.
    async fn translate(
        &mut self,
        event: &Value,
        agent: &dyn AgentApi,
        agent_session_id: &str,
        events: &EventSender,
    ) -> Result<bool> {
        let event_type = event["type"].as_str().unwrap_or("");

        // Heartbeats keep the inactivity deadline fresh but carry no payload;
        // the connected marker is informational only.
        if event_type == "server.heartbeat" || event_type == "server.connected" {
            return Ok(false);
        }

        let props = &event["properties"];
        let event_session_id = props["sessionID"]
            .as_str()
            .or_else(|| props["part"]["sessionID"].as_str())
            .unwrap_or("");
        if !event_session_id.is_empty() && event_session_id != agent_session_id {
            return Ok(false);
        }

        match event_type {
            "message.updated" => {
                let info = &props["info"];
                if info["sessionID"].as_str() != Some(agent_session_id) {
                    return Ok(false);
                }
                let msg_id = info["id"].as_str().unwrap_or("");
                let parent_id = info["parentID"].as_str().unwrap_or("");
                let role = info["role"].as_str().unwrap_or("");

                debug!(
                    role,
                    msg_id,
                    parent_match = parent_id == self.agent_message_id,
                    "message updated"
                );

                if role == "assistant" && parent_id == self.agent_message_id && !msg_id.is_empty()
                {
                    self.allowed_assistant_msg_ids.insert(msg_id.to_string());
                    if let Some(pending) = self.pending_parts.remove(msg_id) {
                        self.pending_total -= pending.len();
                        for (part, delta) in pending {
                            for out in self.handle_part(&part, delta.as_deref()) {
                                events.send(out);
                            }
                        }
                    }
                }
            }

            "message.part.updated" => {
                let part = &props["part"];
                let delta = props["delta"].as_str();
                let msg_id = part["messageID"].as_str().unwrap_or("");
                if self.allowed_assistant_msg_ids.contains(msg_id) {
                    for out in self.handle_part(part, delta) {
                        events.send(out);
                    }
                } else if !msg_id.is_empty() {
                    self.buffer_part(msg_id, part.clone(), delta.map(str::to_string));
                }
            }

            "session.idle" => {
                if props["sessionID"].as_str() == Some(agent_session_id) {
                    debug!(
                        tracked_msgs = self.allowed_assistant_msg_ids.len(),
                        "session idle"
                    );
                    self.fetch_final_message_state(agent, agent_session_id, events)
                        .await;
                    return Ok(true);
                }
            }

            "session.status" => {
                if props["sessionID"].as_str() == Some(agent_session_id)
                    && props["status"]["type"].as_str() == Some("idle")
                {
                    debug!(
                        tracked_msgs = self.allowed_assistant_msg_ids.len(),
                        "session status idle"
                    );
                    self.fetch_final_message_state(agent, agent_session_id, events)
                        .await;
                    return Ok(true);
                }
            }

            "session.error" => {
                if props["sessionID"].as_str() == Some(agent_session_id) {
                    let error = &props["error"];
                    let message = match error {
                        Value::Object(map) => map
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown error")
                            .to_string(),
                        Value::Null => "Unknown error".to_string(),
                        other => other.to_string(),
                    };
                    error!(error = %message, "agent session error");
                    events.send(Event::Error {
                        error: message.clone(),
                        message_id: self.message_id.clone(),
                    });
                    bail!("agent session error: {message}");
                }
            }

            _ => {}
        }

        Ok(false)
    }

    /// Translate one part update into zero or more upstream events.
    fn handle_part(&mut self, part: &Value, delta: Option<&str>) -> Vec<Event> {
        let part_type = part["type"].as_str().unwrap_or("");
        let part_id = part["id"].as_str().unwrap_or("");
        let mut out = Vec::new();

        match part_type {
            "text" => {
                match delta {
                    Some(d) if !d.is_empty() => {
                        self.cumulative_text
                            .entry(part_id.to_string())
                            .or_default()
                            .push_str(d);
                    }
                    _ => {
                        let text = part["text"].as_str().unwrap_or("");
                        self.cumulative_text
                            .insert(part_id.to_string(), text.to_string());
                    }
                }
                if let Some(content) = self.cumulative_text.get(part_id) {
                    if !content.is_empty() {
                        out.push(Event::Token {
                            content: content.clone(),
                            message_id: self.message_id.clone(),
                        });
                    }
                }
            }

            "tool" => {
                let state = &part["state"];
                let status = state["status"].as_str().unwrap_or("");
                let input = &state["input"];

                debug!(
                    tool = part["tool"].as_str().unwrap_or(""),
                    status, "tool part"
                );

                // A pending call with no arguments yet carries no information.
                if matches!(status, "" | "pending") && input_is_empty(input) {
                    return out;
                }

                let call_id = part["callID"].as_str().unwrap_or("");
                let state_key = format!("tool:{call_id}:{status}");
                if self.emitted_tool_states.insert(state_key) {
                    out.push(Event::ToolCall {
                        tool: part["tool"].as_str().unwrap_or("").to_string(),
                        args: if input.is_null() { json!({}) } else { input.clone() },
                        call_id: call_id.to_string(),
                        status: status.to_string(),
                        output: state["output"].as_str().unwrap_or("").to_string(),
                        message_id: self.message_id.clone(),
                    });
                }
            }

            "step-start" => out.push(Event::StepStart {
                message_id: self.message_id.clone(),
            }),

            "step-finish" => out.push(Event::StepFinish {
                cost: part["cost"].clone(),
                tokens: part["tokens"].clone(),
                reason: part["reason"].clone(),
                message_id: self.message_id.clone(),
            }),

            _ => {}
        }

        out
    }

    /// Hold a part for an assistant message that has not been admitted yet.
    fn buffer_part(&mut self, msg_id: &str, part: Value, delta: Option<String>) {
        if self.pending_total >= MAX_PENDING_PART_EVENTS {
            if !self.drop_logged {
                warn!(
                    message_id = %self.message_id,
                    limit = MAX_PENDING_PART_EVENTS,
                    "pending part buffer full; dropping further parts"
                );
                self.drop_logged = true;
            }
            return;
        }
        self.pending_parts
            .entry(msg_id.to_string())
            .or_default()
            .push((part, delta));
        self.pending_total += 1;
    }

    /// Fetch the final message list and emit any text the stream under-
    /// delivered. Only messages belonging to this prompt are considered:
    /// parent-ID match, or ids admitted during streaming.
    async fn fetch_final_message_state(
        &mut self,
        agent: &dyn AgentApi,
        agent_session_id: &str,
        events: &EventSender,
    ) {
        let messages = match agent.list_messages(agent_session_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!("final message state fetch failed: {e:#}");
                return;
            }
        };
        let Some(messages) = messages.as_array() else {
            return;
        };

        for msg in messages {
            let info = &msg["info"];
            if info["role"].as_str() != Some("assistant") {
                continue;
            }
            let msg_id = info["id"].as_str().unwrap_or("");
            let parent_matches = info["parentID"].as_str() == Some(&self.agent_message_id);
            let tracked = self.allowed_assistant_msg_ids.contains(msg_id);
            if !parent_matches && !tracked {
                continue;
            }

            let Some(parts) = msg["parts"].as_array() else {
                continue;
            };
            for part in parts {
                if part["type"].as_str() != Some("text") {
                    continue;
                }
                let part_id = part["id"].as_str().unwrap_or("");
                let text = part["text"].as_str().unwrap_or("");
                let sent_len = self
                    .cumulative_text
                    .get(part_id)
                    .map(String::len)
                    .unwrap_or(0);
                if text.len() > sent_len {
                    debug!(
                        prev_len = sent_len,
                        new_len = text.len(),
                        "emitting text recovered from final message state"
                    );
                    self.cumulative_text
                        .insert(part_id.to_string(), text.to_string());
                    events.send(Event::Token {
                        content: text.to_string(),
                        message_id: self.message_id.clone(),
                    });
                }
            }
        }
    }

    async fn stop_agent(&self, agent: &dyn AgentApi, agent_session_id: &str, reason: &str) {
        match agent.stop_session(agent_session_id).await {
            Ok(()) => debug!(reason, "agent stop requested"),
            Err(e) => warn!(reason, "agent stop request failed: {e:#}"),
        }
    }
}

fn input_is_empty(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
