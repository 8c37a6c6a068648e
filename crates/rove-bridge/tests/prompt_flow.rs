// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end prompt session tests against a scripted agent.
//!
//! The mock agent plays back a fixed SSE event sequence and a fixed final
//! message list; assertions run over the exact frames the session emits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rove_bridge::{AgentApi, BridgeError, EventSender, PromptSession, SseStream};

const SESSION: &str = "oc-session-123";

struct MockAgent {
    sse_events: Mutex<Vec<Value>>,
    /// Keep the stream open after the scripted events instead of ending it.
    hang_after_events: bool,
    messages: Value,
    prompt_bodies: Mutex<Vec<Value>>,
    stop_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MockAgent {
    fn new(sse_events: Vec<Value>) -> Self {
        Self {
            sse_events: Mutex::new(sse_events),
            hang_after_events: false,
            messages: json!([]),
            prompt_bodies: Mutex::new(Vec::new()),
            stop_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn hanging(mut self) -> Self {
        self.hang_after_events = true;
        self
    }

    fn with_messages(mut self, messages: Value) -> Self {
        self.messages = messages;
        self
    }
}

#[async_trait]
impl AgentApi for MockAgent {
    async fn create_session(&self) -> Result<String> {
        Ok(SESSION.to_string())
    }

    async fn session_exists(&self, _session_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn prompt_async(&self, _session_id: &str, body: &Value) -> Result<()> {
        self.prompt_bodies.lock().unwrap().push(body.clone());
        Ok(())
    }

    async fn stop_session(&self, _session_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_messages(&self, _session_id: &str) -> Result<Value> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.clone())
    }

    async fn subscribe_events(&self) -> Result<SseStream> {
        let events: Vec<Result<Value>> = self
            .sse_events
            .lock()
            .unwrap()
            .clone()
            .into_iter()
            .map(Ok)
            .collect();
        let head = futures::stream::iter(events);
        if self.hang_after_events {
            Ok(Box::pin(head.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }
}

fn sender() -> (EventSender, mpsc::UnboundedReceiver<String>) {
    let sender = EventSender::new("sb-test");
    let (tx, rx) = mpsc::unbounded_channel();
    sender.attach(tx);
    (sender, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
}

fn tokens(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f["type"] == "token")
        .map(|f| f["content"].as_str().unwrap().to_string())
        .collect()
}

// ── Scripted event builders ───────────────────────────────────────────────────

fn admit(msg_id: &str, parent_id: &str) -> Value {
    json!({
        "type": "message.updated",
        "properties": {
            "info": {
                "id": msg_id,
                "parentID": parent_id,
                "role": "assistant",
                "sessionID": SESSION,
            }
        }
    })
}

fn text_part(msg_id: &str, part_id: &str, text: &str, delta: Option<&str>) -> Value {
    let mut props = json!({
        "part": {
            "type": "text",
            "id": part_id,
            "messageID": msg_id,
            "sessionID": SESSION,
            "text": text,
        }
    });
    if let Some(d) = delta {
        props["delta"] = json!(d);
    }
    json!({ "type": "message.part.updated", "properties": props })
}

fn idle() -> Value {
    json!({ "type": "session.idle", "properties": { "sessionID": SESSION } })
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delta_accumulation_emits_cumulative_tokens() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let agent = MockAgent::new(vec![
        json!({"type": "server.connected"}),
        admit("oc-assistant-1", &parent),
        text_part("oc-assistant-1", "part-1", "", Some("Hello")),
        text_part("oc-assistant-1", "part-1", "", Some(" world")),
        idle(),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "say hello", None)
        .await
        .unwrap();

    let frames = drain(&mut rx);
    assert_eq!(tokens(&frames), vec!["Hello", "Hello world"]);
    for frame in frames.iter().filter(|f| f["type"] == "token") {
        assert_eq!(frame["messageId"], "cp-1");
    }

    // The prompt request carried our ascending user-message id.
    let bodies = agent.prompt_bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["messageID"], parent.as_str());
    assert_eq!(bodies[0]["parts"][0]["text"], "say hello");
}

#[tokio::test]
async fn model_override_is_forwarded_split() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let agent = MockAgent::new(vec![admit("a1", &parent), idle()]);
    let (sender, _rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", Some("claude-haiku-4-5"))
        .await
        .unwrap();

    let bodies = agent.prompt_bodies.lock().unwrap();
    assert_eq!(bodies[0]["model"]["providerID"], "anthropic");
    assert_eq!(bodies[0]["model"]["modelID"], "claude-haiku-4-5");
}

#[tokio::test]
async fn parts_are_buffered_until_admission() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    // Part arrives before the message.updated that admits its message.
    let agent = MockAgent::new(vec![
        text_part("oc-assistant-1", "part-1", "", Some("Hello")),
        text_part("oc-assistant-1", "part-1", "", Some(" world")),
        admit("oc-assistant-1", &parent),
        idle(),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    // Buffered parts flush in arrival order on admission.
    assert_eq!(tokens(&drain(&mut rx)), vec!["Hello", "Hello world"]);
}

#[tokio::test]
async fn unadmitted_messages_emit_nothing() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    // No admission ever happens for this assistant id.
    let agent = MockAgent::new(vec![
        text_part("oc-other-assistant", "part-1", "", Some("stale")),
        idle(),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    assert!(tokens(&drain(&mut rx)).is_empty());
}

#[tokio::test]
async fn events_from_other_sessions_are_filtered() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let mut foreign = text_part("oc-assistant-9", "part-9", "", Some("other session"));
    foreign["properties"]["part"]["sessionID"] = json!("oc-session-OTHER");

    let agent = MockAgent::new(vec![
        foreign,
        json!({ "type": "session.idle", "properties": { "sessionID": "oc-session-OTHER" } }),
        admit("oc-assistant-1", &parent),
        text_part("oc-assistant-1", "part-1", "", Some("ours")),
        idle(),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    assert_eq!(tokens(&drain(&mut rx)), vec!["ours"]);
}

#[tokio::test]
async fn session_status_idle_terminates_too() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let agent = MockAgent::new(vec![
        admit("a1", &parent),
        text_part("a1", "part-1", "", Some("done")),
        json!({
            "type": "session.status",
            "properties": { "sessionID": SESSION, "status": { "type": "idle" } }
        }),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    assert_eq!(tokens(&drain(&mut rx)), vec!["done"]);
    assert_eq!(agent.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn final_fetch_tops_up_longer_text() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let agent = MockAgent::new(vec![
        admit("a1", &parent),
        text_part("a1", "part-1", "", Some("Hello")),
        idle(),
    ])
    .with_messages(json!([{
        "info": { "id": "a1", "parentID": parent, "role": "assistant", "sessionID": SESSION },
        "parts": [{ "type": "text", "id": "part-1", "text": "Hello world, complete" }],
    }]));
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    assert_eq!(
        tokens(&drain(&mut rx)),
        vec!["Hello", "Hello world, complete"]
    );
}

#[tokio::test]
async fn final_fetch_skips_text_already_sent() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    let agent = MockAgent::new(vec![
        admit("a1", &parent),
        text_part("a1", "part-1", "", Some("Hello world")),
        idle(),
    ])
    .with_messages(json!([{
        "info": { "id": "a1", "parentID": parent, "role": "assistant", "sessionID": SESSION },
        "parts": [{ "type": "text", "id": "part-1", "text": "Hello" }],
    }]));
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    assert_eq!(tokens(&drain(&mut rx)), vec!["Hello world"]);
}

#[tokio::test]
async fn final_fetch_ignores_user_and_foreign_messages() {
    let mut session = PromptSession::new("cp-2", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();
    // The message list still contains the previous prompt's assistant reply
    // (different parent) and the user messages themselves.
    let agent = MockAgent::new(vec![admit("a2", &parent), idle()]).with_messages(json!([
        {
            "info": { "id": "u1", "parentID": "", "role": "user", "sessionID": SESSION },
            "parts": [{ "type": "text", "id": "up-1", "text": "commit hash?" }],
        },
        {
            "info": { "id": "a1", "parentID": "msg_000previous00", "role": "assistant",
                      "sessionID": SESSION },
            "parts": [{ "type": "text", "id": "p-old", "text": "the hash is 073d4e7" }],
        },
        {
            "info": { "id": "a2", "parentID": parent, "role": "assistant", "sessionID": SESSION },
            "parts": [{ "type": "text", "id": "p-new", "text": "author is Test User" }],
        },
    ]));
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "who wrote it?", None)
        .await
        .unwrap();

    assert_eq!(tokens(&drain(&mut rx)), vec!["author is Test User"]);
}

#[tokio::test]
async fn session_error_emits_error_event_and_fails() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let agent = MockAgent::new(vec![json!({
        "type": "session.error",
        "properties": {
            "sessionID": SESSION,
            "error": { "message": "model overloaded" },
        }
    })]);
    let (sender, mut rx) = sender();

    let result = session.run(&agent, SESSION, &sender, "hi", None).await;
    assert!(result.is_err());

    let frames = drain(&mut rx);
    let errors: Vec<&Value> = frames.iter().filter(|f| f["type"] == "error").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], "model overloaded");
    assert_eq!(errors[0]["messageId"], "cp-1");
}

#[tokio::test]
async fn inactivity_timeout_stops_agent_and_fails() {
    let mut session = PromptSession::new("cp-1", Duration::from_millis(200));
    let agent = MockAgent::new(vec![json!({"type": "server.connected"})]).hanging();
    let (sender, _rx) = sender();

    let result = session.run(&agent, SESSION, &sender, "hi", None).await;

    let err = result.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::SseInactivityTimeout { .. })
        ),
        "unexpected error: {err:#}"
    );
    assert_eq!(agent.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn steady_events_reset_the_inactivity_deadline() {
    let mut session = PromptSession::new("cp-1", Duration::from_millis(400));
    let parent = session.agent_message_id().to_string();

    // Events delivered with 100ms gaps; total runtime exceeds the window
    // but no single gap does.
    let (tx, rx) = mpsc::unbounded_channel::<Result<Value>>();
    let feeder = tokio::spawn(async move {
        let script = vec![
            json!({"type": "server.heartbeat"}),
            admit("a1", &parent),
            text_part("a1", "part-1", "", Some("slow")),
            json!({"type": "server.heartbeat"}),
            json!({"type": "server.heartbeat"}),
            idle(),
        ];
        for event in script {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if tx.send(Ok(event)).is_err() {
                return;
            }
        }
    });

    struct ChannelAgent {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Value>>>>,
        inner: MockAgent,
    }

    #[async_trait]
    impl AgentApi for ChannelAgent {
        async fn create_session(&self) -> Result<String> {
            self.inner.create_session().await
        }
        async fn session_exists(&self, id: &str) -> Result<bool> {
            self.inner.session_exists(id).await
        }
        async fn prompt_async(&self, id: &str, body: &Value) -> Result<()> {
            self.inner.prompt_async(id, body).await
        }
        async fn stop_session(&self, id: &str) -> Result<()> {
            self.inner.stop_session(id).await
        }
        async fn list_messages(&self, id: &str) -> Result<Value> {
            self.inner.list_messages(id).await
        }
        async fn subscribe_events(&self) -> Result<SseStream> {
            let rx = self.rx.lock().unwrap().take().expect("single subscription");
            Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
        }
    }

    let agent = ChannelAgent {
        rx: Mutex::new(Some(rx)),
        inner: MockAgent::new(vec![]),
    };
    let (sender, mut out) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();
    feeder.await.unwrap();

    assert_eq!(tokens(&drain(&mut out)), vec!["slow"]);
}

#[tokio::test]
async fn absolute_duration_bound_fails_long_prompts() {
    let mut session =
        PromptSession::new("cp-1", Duration::from_secs(5)).with_max_duration(Duration::ZERO);
    let agent = MockAgent::new(vec![json!({"type": "server.connected"})]).hanging();
    let (sender, _rx) = sender();

    let result = session.run(&agent, SESSION, &sender, "hi", None).await;

    let err = result.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::PromptMaxDuration(_))
        ),
        "unexpected error: {err:#}"
    );
    assert_eq!(agent.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tool_states_are_deduplicated_across_the_stream() {
    let mut session = PromptSession::new("cp-1", Duration::from_secs(5));
    let parent = session.agent_message_id().to_string();

    let tool_part = |status: &str| {
        json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "type": "tool",
                    "id": "part-t",
                    "messageID": "a1",
                    "sessionID": SESSION,
                    "tool": "bash",
                    "callID": "call-1",
                    "state": { "status": status, "input": {"command": "ls"}, "output": "" },
                }
            }
        })
    };

    let agent = MockAgent::new(vec![
        admit("a1", &parent),
        tool_part("running"),
        tool_part("running"),
        tool_part("completed"),
        idle(),
    ]);
    let (sender, mut rx) = sender();

    session
        .run(&agent, SESSION, &sender, "hi", None)
        .await
        .unwrap();

    let frames = drain(&mut rx);
    let calls: Vec<String> = frames
        .iter()
        .filter(|f| f["type"] == "tool_call")
        .map(|f| f["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(calls, vec!["running", "completed"]);
}
