// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Control-plane link — the single bidirectional session channel.
//!
//! One websocket connection per sandbox, reconnected with exponential
//! backoff on transport failures. Inbound frames are JSON commands; the
//! prompt command runs on a background task so the read path stays
//! responsive to `stop`/`push`/`shutdown` while a prompt streams.
//!
//! Handshake rejections that retrying cannot fix (unauthorized, forbidden,
//! not-found, gone) short-circuit the reconnect loop: the bridge exits with
//! code 0 and the supervisor treats that as an intentional shutdown.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::Message;

use rove_protocol::{Author, Command, Event};

use crate::agent::AgentApi;
use crate::config::{
    BridgeConfig, HEARTBEAT_INTERVAL, PING_INTERVAL, PONG_TIMEOUT, RECONNECT_MAX_DELAY,
};
use crate::error::BridgeError;
use crate::git;
use crate::prompt::PromptSession;
use crate::state::SessionStore;

/// Seconds since the epoch as a float, the wire timestamp format.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── Event sender ──────────────────────────────────────────────────────────────

/// Cloneable handle for emitting events on the link.
///
/// Stamps `sandboxId` and a `timestamp` (if absent) onto every event and
/// writes it to the link's outbound queue. When no connection is attached
/// the event is dropped with a debug log — callers never observe an error.
#[derive(Clone)]
pub struct EventSender {
    sandbox_id: String,
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>,
}

impl EventSender {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Attach the outbound queue of a live connection.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.tx.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Drop the outbound queue; subsequent sends become no-ops.
    pub fn detach(&self) {
        *self.tx.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn send(&self, event: Event) {
        let event_type = event.kind();
        let guard = self.tx.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            debug!(event_type, "link not open; dropping event");
            return;
        };

        let mut value = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                error!(event_type, "event serialization failed: {e}");
                return;
            }
        };
        value["sandboxId"] = json!(self.sandbox_id);
        if value.get("timestamp").is_none() {
            value["timestamp"] = json!(unix_now());
        }

        if tx.send(value.to_string()).is_err() {
            debug!(event_type, "link writer gone; dropping event");
        }
    }
}

/// Backoff before reconnect attempt `n` (1-based): `min(2^n, 60)` seconds.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(secs.min(RECONNECT_MAX_DELAY.as_secs_f64()))
}

// ── Bridge ────────────────────────────────────────────────────────────────────

/// The long-lived in-sandbox process: one agent, one link.
///
/// Cheap to clone; per-prompt background tasks each hold a clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    cfg: BridgeConfig,
    agent: Arc<dyn AgentApi>,
    events: EventSender,
    agent_session_id: Mutex<Option<String>>,
    store: SessionStore,
    workspace: PathBuf,
    sse_inactivity: Duration,
    shutdown: tokio_util::sync::CancellationToken,
    git_sync: watch::Sender<bool>,
}

impl Bridge {
    pub fn new(cfg: BridgeConfig, agent: Arc<dyn AgentApi>) -> Self {
        Self::with_paths(
            cfg,
            agent,
            SessionStore::new(SessionStore::default_path()),
            PathBuf::from("/workspace"),
        )
    }

    /// Constructor with explicit paths, for tests and unusual layouts.
    pub fn with_paths(
        cfg: BridgeConfig,
        agent: Arc<dyn AgentApi>,
        store: SessionStore,
        workspace: PathBuf,
    ) -> Self {
        let (git_sync, _) = watch::channel(false);
        Self {
            inner: Arc::new(BridgeInner {
                events: EventSender::new(cfg.sandbox_id.clone()),
                sse_inactivity: crate::config::sse_inactivity_timeout(),
                cfg,
                agent,
                agent_session_id: Mutex::new(None),
                store,
                workspace,
                shutdown: tokio_util::sync::CancellationToken::new(),
                git_sync,
            }),
        }
    }

    /// Token tripped by the shutdown command or a fatal link rejection.
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Observe the supervisor-driven git sync flag.
    pub fn git_sync_complete(&self) -> watch::Receiver<bool> {
        self.inner.git_sync.subscribe()
    }

    /// Main loop: connect, serve, reconnect. Returns `Ok` both for a
    /// commanded shutdown and for a fatal link rejection; the process exits
    /// 0 either way so the supervisor mirrors the shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            sandbox_id = %self.inner.cfg.sandbox_id,
            session_id = %self.inner.cfg.session_id,
            "bridge starting"
        );

        self.load_persisted_session().await;

        let mut attempts: u32 = 0;
        while !self.inner.shutdown.is_cancelled() {
            match self.connect_and_serve().await {
                Ok(()) => {
                    attempts = 0;
                    warn!("control plane connection closed");
                }
                Err(e) => {
                    if let Some(BridgeError::SessionTerminated(status)) = e.downcast_ref() {
                        info!(status, "session rejected by control plane; shutting down");
                        self.inner.shutdown.cancel();
                        break;
                    }
                    warn!("control plane connection error: {e:#}");
                }
            }

            if self.inner.shutdown.is_cancelled() {
                break;
            }

            attempts += 1;
            let delay = reconnect_delay(attempts);
            info!(
                attempt = attempts,
                delay_s = delay.as_secs_f64(),
                "reconnecting to control plane"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => break,
            }
        }

        info!("bridge stopped");
        Ok(())
    }

    /// Validate the session id persisted by a previous bridge instance.
    async fn load_persisted_session(&self) {
        let Some(id) = self.inner.store.load() else { return };
        match self.inner.agent.session_exists(&id).await {
            Ok(true) => {
                info!(agent_session_id = %id, "resuming persisted agent session");
                *self.inner.agent_session_id.lock().await = Some(id);
            }
            Ok(false) => {
                info!(agent_session_id = %id, "persisted agent session is gone; discarding");
            }
            Err(e) => {
                debug!("agent session probe failed: {e:#}");
            }
        }
    }

    /// One connection lifetime: handshake, serve until close or error.
    async fn connect_and_serve(&self) -> Result<()> {
        let mut request = self.inner.cfg.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.inner.cfg.token))?,
        );
        headers.insert("X-Sandbox-ID", HeaderValue::from_str(&self.inner.cfg.sandbox_id)?);

        let (ws, _) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(resp)) => {
                let status = resp.status().as_u16();
                if matches!(status, 401 | 403 | 404 | 410) {
                    return Err(BridgeError::SessionTerminated(status).into());
                }
                return Err(anyhow!("websocket handshake failed: HTTP {status}"));
            }
            Err(e) => return Err(e.into()),
        };
        info!("connected to control plane");

        let (mut sink, mut stream) = ws.split();
        let (tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.inner.events.attach(tx);

        self.inner.events.send(Event::Ready {
            agent_session_id: self.inner.agent_session_id.lock().await.clone(),
        });

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        let mut last_rx = tokio::time::Instant::now();
        let mut prompt_tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        let result = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Ok(()),

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = tokio::time::Instant::now();
                        self.dispatch_command(&text, &mut prompt_tasks).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_rx = tokio::time::Instant::now();
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break Err(anyhow!("connection closed while answering ping"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_rx = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => break Err(anyhow!("websocket receive error: {e}")),
                },

                Some(frame) = out_rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        break Err(anyhow!("websocket send error: {e}"));
                    }
                }

                _ = heartbeat.tick() => {
                    self.inner.events.send(Event::Heartbeat {
                        status: "ready".to_string(),
                        timestamp: unix_now(),
                    });
                }

                _ = ping.tick() => {
                    if last_rx.elapsed() > PING_INTERVAL + PONG_TIMEOUT {
                        break Err(anyhow!(
                            "control plane unresponsive (no data for {}s)",
                            last_rx.elapsed().as_secs()
                        ));
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break Err(anyhow!("connection closed while sending ping"));
                    }
                }
            }
        };

        self.inner.events.detach();

        // A prompt cut short by disconnect or shutdown still owes its
        // terminal event; with the link down the send is a silent no-op,
        // which matches the control plane re-syncing on reconnect.
        for (message_id, handle) in prompt_tasks {
            if !handle.is_finished() {
                handle.abort();
            }
            self.reap_prompt_task(&message_id, handle).await;
        }

        result
    }

    /// Parse and execute one inbound frame.
    ///
    /// Malformed JSON and unknown command types are logged and ignored; the
    /// link must survive anything the control plane sends.
    async fn dispatch_command(
        &self,
        text: &str,
        prompt_tasks: &mut Vec<(String, JoinHandle<()>)>,
    ) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid command JSON: {e}");
                return;
            }
        };
        let cmd: Command = match serde_json::from_value(value.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!(
                    cmd_type = value["type"].as_str().unwrap_or("<missing>"),
                    "unknown command: {e}"
                );
                return;
            }
        };

        match cmd {
            Command::Prompt {
                message_id,
                content,
                model,
                author,
            } => {
                // Reap finished tasks so the in-flight set stays bounded and
                // panics surface as failed completions.
                let mut in_flight = Vec::new();
                for (mid, handle) in prompt_tasks.drain(..) {
                    if handle.is_finished() {
                        self.reap_prompt_task(&mid, handle).await;
                    } else {
                        in_flight.push((mid, handle));
                    }
                }
                *prompt_tasks = in_flight;

                let bridge = self.clone();
                let mid = message_id.clone();
                let handle = tokio::spawn(async move {
                    bridge.handle_prompt(mid, content, model, author).await;
                });
                prompt_tasks.push((message_id, handle));
            }

            Command::Stop => {
                info!("stop requested");
                self.request_agent_stop("command").await;
            }

            Command::Snapshot => {
                info!("snapshot requested");
                self.inner.events.send(Event::SnapshotReady {
                    agent_session_id: self.inner.agent_session_id.lock().await.clone(),
                });
            }

            Command::Shutdown => {
                info!("shutdown requested");
                self.inner.shutdown.cancel();
            }

            Command::GitSyncComplete => {
                debug!("git sync complete signal");
                let _ = self.inner.git_sync.send(true);
            }

            Command::Push {
                branch_name,
                repo_owner,
                repo_name,
                github_token,
            } => {
                self.handle_push(branch_name, repo_owner, repo_name, github_token)
                    .await;
            }
        }
    }

    /// Surface the outcome of a prompt task that did not finish normally.
    async fn reap_prompt_task(&self, message_id: &str, handle: JoinHandle<()>) {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                self.inner.events.send(Event::ExecutionComplete {
                    message_id: message_id.to_string(),
                    success: false,
                    error: Some("Task was cancelled".to_string()),
                });
            }
            Err(e) => {
                error!(message_id, "prompt task panicked: {e}");
                self.inner.events.send(Event::ExecutionComplete {
                    message_id: message_id.to_string(),
                    success: false,
                    error: Some(format!("prompt task failed: {e}")),
                });
            }
        }
    }

    // ── Command handlers ──────────────────────────────────────────────────────

    /// Run one prompt end to end. Always emits exactly one
    /// `execution_complete`, with `success` reflecting the outcome.
    async fn handle_prompt(
        &self,
        message_id: String,
        content: String,
        model: Option<String>,
        author: Option<Author>,
    ) {
        let start = std::time::Instant::now();
        info!(message_id = %message_id, model = ?model, "prompt start");

        let user = git::GitUser::from_author(author.as_ref());
        match git::find_repo_dir(&self.inner.workspace) {
            Some(repo) => git::configure_identity(&repo, &user).await,
            None => debug!("no repository; skipping git identity"),
        }

        let result = self.run_prompt(&message_id, &content, model.as_deref()).await;
        let outcome = if result.is_ok() { "success" } else { "error" };

        match result {
            Ok(()) => self.inner.events.send(Event::ExecutionComplete {
                message_id: message_id.clone(),
                success: true,
                error: None,
            }),
            Err(e) => {
                error!(message_id = %message_id, "prompt failed: {e:#}");
                self.inner.events.send(Event::ExecutionComplete {
                    message_id: message_id.clone(),
                    success: false,
                    error: Some(format!("{e:#}")),
                });
            }
        }

        info!(
            message_id = %message_id,
            outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "prompt finished"
        );
    }

    async fn run_prompt(
        &self,
        message_id: &str,
        content: &str,
        model: Option<&str>,
    ) -> Result<()> {
        let agent_session_id = self.ensure_agent_session().await?;
        let mut session = PromptSession::new(message_id, self.inner.sse_inactivity);
        session
            .run(
                self.inner.agent.as_ref(),
                &agent_session_id,
                &self.inner.events,
                content,
                model,
            )
            .await
    }

    /// Return the current agent session id, creating and persisting one on
    /// first use.
    async fn ensure_agent_session(&self) -> Result<String> {
        let mut guard = self.inner.agent_session_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let id = self.inner.agent.create_session().await?;
        info!(agent_session_id = %id, "created agent session");
        if let Err(e) = self.inner.store.save(&id) {
            error!("failed to persist agent session id: {e:#}");
        }
        *guard = Some(id.clone());
        Ok(id)
    }

    async fn request_agent_stop(&self, reason: &str) {
        let Some(id) = self.inner.agent_session_id.lock().await.clone() else {
            return;
        };
        match self.inner.agent.stop_session(&id).await {
            Ok(()) => info!(reason, "agent stop requested"),
            Err(e) => warn!(reason, "agent stop request failed: {e:#}"),
        }
    }

    async fn handle_push(
        &self,
        branch_name: String,
        repo_owner: Option<String>,
        repo_name: Option<String>,
        github_token: Option<String>,
    ) {
        let repo_owner = repo_owner
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("REPO_OWNER").ok())
            .unwrap_or_default();
        let repo_name = repo_name
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("REPO_NAME").ok())
            .unwrap_or_default();
        let (token, token_source) = git::resolve_github_token(
            github_token.as_deref(),
            std::env::var("GITHUB_APP_TOKEN").ok().as_deref(),
        );

        info!(
            branch_name = %branch_name,
            repo_owner = %repo_owner,
            repo_name = %repo_name,
            token_source,
            "push start"
        );

        let Some(repo) = git::find_repo_dir(&self.inner.workspace) else {
            warn!("push failed: no repository");
            self.inner.events.send(Event::PushError {
                error: "No repository found".to_string(),
                branch_name: None,
            });
            return;
        };

        if token.is_empty() || repo_owner.is_empty() || repo_name.is_empty() {
            warn!("push failed: missing credentials");
            self.inner.events.send(Event::PushError {
                error: "Push failed - GitHub authentication token is required".to_string(),
                branch_name: Some(branch_name),
            });
            return;
        }

        match git::push_head(&repo, &branch_name, &repo_owner, &repo_name, &token).await {
            Ok(()) => {
                info!(branch_name = %branch_name, "push complete");
                self.inner.events.send(Event::PushComplete { branch_name });
            }
            Err(e) => {
                warn!(branch_name = %branch_name, "push failed: {e:#}");
                self.inner.events.send(Event::PushError {
                    error: format!("{e:#}"),
                    branch_name: Some(branch_name),
                });
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
