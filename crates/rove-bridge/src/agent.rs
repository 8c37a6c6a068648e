// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Client for the local agent server's REST + SSE surface.
//!
//! The bridge only ever talks to one agent on localhost, but the surface is
//! a trait so the prompt session can be exercised against a scripted agent
//! in tests. Endpoints used:
//!
//! - `POST /session` → `{id}` — create a conversation session
//! - `GET /session/<id>` — probe that a persisted session still exists
//! - `POST /session/<id>/prompt_async` — submit a prompt, returns immediately
//! - `POST /session/<id>/stop` — best-effort abort
//! - `GET /session/<id>/message` — final message list
//! - `GET /event` — long-lived SSE stream (no read timeout)

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tracing::error;

use crate::config::{AGENT_REQUEST_TIMEOUT, HTTP_CONNECT_TIMEOUT};
use crate::error::BridgeError;
use crate::sse;

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// The agent server surface the bridge depends on.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn create_session(&self) -> Result<String>;

    /// Whether a previously persisted session id is still valid.
    async fn session_exists(&self, session_id: &str) -> Result<bool>;

    /// Submit a prompt asynchronously; results arrive on the event stream.
    async fn prompt_async(&self, session_id: &str, body: &Value) -> Result<()>;

    async fn stop_session(&self, session_id: &str) -> Result<()>;

    /// Full message list for a session, as returned by the agent.
    async fn list_messages(&self, session_id: &str) -> Result<Value>;

    /// Open the agent's global SSE stream.
    async fn subscribe_events(&self) -> Result<SseStream>;
}

/// reqwest-backed client for the agent on `http://localhost:<port>`.
pub struct HttpAgentClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // No default request timeout: it would also bound the SSE body.
        // REST calls set their own per-request timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .context("building agent HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn create_session(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&json!({}))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await
            .context("agent session create request failed")?
            .error_for_status()
            .context("agent session create rejected")?;

        let body: Value = resp.json().await.context("agent session create body")?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .context("agent session create response had no id")
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/session/{session_id}", self.base_url))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await
            .context("agent session probe failed")?;
        Ok(resp.status() == reqwest::StatusCode::OK)
    }

    async fn prompt_async(&self, session_id: &str, body: &Value) -> Result<()> {
        let resp = self
            .client
            .post(format!(
                "{}/session/{session_id}/prompt_async",
                self.base_url
            ))
            .json(body)
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await
            .context("agent prompt request failed")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::NO_CONTENT {
            let error_body = resp.text().await.unwrap_or_default();
            error!(
                status = status.as_u16(),
                error_body, "agent prompt request rejected"
            );
            return Err(BridgeError::PromptRequest {
                status: status.as_u16(),
                body: error_body,
            }
            .into());
        }
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/session/{session_id}/stop", self.base_url))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await
            .context("agent stop request failed")?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}/session/{session_id}/message", self.base_url))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await
            .context("agent message list request failed")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            anyhow::bail!("agent message list returned HTTP {}", status.as_u16());
        }
        resp.json().await.context("agent message list body")
    }

    async fn subscribe_events(&self) -> Result<SseStream> {
        let resp = self
            .client
            .get(format!("{}/event", self.base_url))
            .send()
            .await
            .context("agent SSE connect failed")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(BridgeError::SseConnection(status.as_u16()).into());
        }
        Ok(Box::pin(sse::event_stream(resp.bytes_stream())))
    }
}
