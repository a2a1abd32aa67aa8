//! The chat relay behind one client connection.
//!
//! Two tasks share a queue of turns: the receiver parses client frames,
//! answering stop commands immediately and queueing chat messages; the
//! processor runs queued turns one at a time against the session's worker.
//! Whichever task ends first, the other is cancelled.
//!
//! The relay is transport-agnostic: it reads client frames from a stream of
//! strings and writes [`OutboundMessage`]s to a channel, which the server
//! bridges to a WebSocket.

mod turn;

use anyhow::{anyhow, Result};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::controller::{InterruptReport, SandboxController};
use crate::ipc::WorkerEvent;
use crate::session::Session;

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientCommand {
    Stop,
    Chat {
        message: String,
        file_ids: Vec<String>,
    },
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    file_ids: Vec<String>,
}

/// Parse a client frame: `{"type":"stop"}` or `{"message": ..., "file_ids": [...]}`.
pub(crate) fn parse_command(text: &str) -> Result<ClientCommand, serde_json::Error> {
    let raw: RawCommand = serde_json::from_str(text)?;
    if raw.kind.as_deref() == Some("stop") {
        return Ok(ClientCommand::Stop);
    }
    let message = raw
        .message
        .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("message"))?;
    Ok(ClientCommand::Chat {
        message,
        file_ids: raw.file_ids,
    })
}

/// Events the relay adds to the worker's own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ControlEvent {
    SandboxStatus {
        is_new: bool,
    },
    StopAcknowledged {
        #[serde(flatten)]
        result: InterruptReport,
    },
}

/// Payload of a `stream` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub(crate) enum StreamEvent {
    Worker(WorkerEvent),
    Control(ControlEvent),
}

impl From<WorkerEvent> for StreamEvent {
    fn from(event: WorkerEvent) -> Self {
        Self::Worker(event)
    }
}

impl From<ControlEvent> for StreamEvent {
    fn from(event: ControlEvent) -> Self {
        Self::Control(event)
    }
}

/// A message sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum OutboundMessage {
    Stream {
        event: StreamEvent,
        timestamp: String,
    },
    Complete {
        role: String,
        content: String,
        timestamp: String,
    },
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl OutboundMessage {
    pub(crate) fn stream(event: impl Into<StreamEvent>) -> Self {
        Self::Stream {
            event: event.into(),
            timestamp: timestamp(),
        }
    }

    pub(crate) fn complete(content: impl Into<String>) -> Self {
        Self::Complete {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: timestamp(),
        }
    }
}

/// Sending half of the connection's outbox.
pub(crate) type Outbox = mpsc::UnboundedSender<OutboundMessage>;

/// The client went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("client disconnected")]
pub(crate) struct ClientGone;

fn send(outbox: &Outbox, message: OutboundMessage) -> Result<(), ClientGone> {
    outbox.send(message).map_err(|_| ClientGone)
}

/// A queued chat message.
#[derive(Debug)]
struct ChatTurn {
    message: String,
    file_ids: Vec<String>,
}

/// Relays one client connection for one session.
pub(crate) struct Relay {
    controller: Arc<SandboxController>,
    catalog: Catalog,
    session: Session,
    /// Set by a stop command, reset when a turn starts
    interrupted: AtomicBool,
}

impl Relay {
    pub(crate) fn new(controller: Arc<SandboxController>, catalog: Catalog, session: Session) -> Self {
        Self {
            controller,
            catalog,
            session,
            interrupted: AtomicBool::new(false),
        }
    }

    /// Serve the connection until the client goes away.
    ///
    /// An error means the relay itself failed, as opposed to a turn.
    pub(crate) async fn run<S>(self, inbound: S, outbox: Outbox) -> Result<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let relay = Arc::new(self);
        let (turns_tx, turns_rx) = mpsc::unbounded_channel();

        let mut receiver = tokio::spawn(relay.clone().receive(inbound, turns_tx, outbox.clone()));
        let mut processor = tokio::spawn(relay.clone().process(turns_rx, outbox));

        let finished = tokio::select! {
            joined = &mut receiver => {
                processor.abort();
                let _ = processor.await;
                joined
            }
            joined = &mut processor => {
                receiver.abort();
                let _ = receiver.await;
                joined
            }
        };
        info!(session = %relay.session.id, "relay closed");
        finished.map_err(|e| anyhow!("relay task failed: {e}"))
    }

    async fn receive<S>(
        self: Arc<Self>,
        inbound: S,
        turns: mpsc::UnboundedSender<ChatTurn>,
        outbox: Outbox,
    ) where
        S: Stream<Item = String> + Send + 'static,
    {
        futures_util::pin_mut!(inbound);
        while let Some(frame) = inbound.next().await {
            let delivered = match parse_command(&frame) {
                Ok(ClientCommand::Stop) => self.stop(&outbox).await,
                Ok(ClientCommand::Chat { message, file_ids }) => {
                    if turns.send(ChatTurn { message, file_ids }).is_err() {
                        break;
                    }
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "invalid client frame");
                    send(
                        &outbox,
                        OutboundMessage::stream(WorkerEvent::error(format!("Invalid message: {e}"))),
                    )
                }
            };
            if delivered.is_err() {
                break;
            }
        }
        debug!(session = %self.session.id, "client stopped sending");
    }

    async fn stop(&self, outbox: &Outbox) -> Result<(), ClientGone> {
        self.interrupted.store(true, Ordering::SeqCst);
        let result = match self.controller.interrupt(&self.session).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "failed to raise interrupt");
                InterruptReport {
                    interrupted: false,
                    sandbox_name: self.session.sandbox_name(),
                    message: format!("Interrupt failed: {e}"),
                }
            }
        };
        info!(session = %self.session.id, interrupted = result.interrupted, "stop requested");
        send(
            outbox,
            OutboundMessage::stream(ControlEvent::StopAcknowledged { result }),
        )
    }

    async fn process(self: Arc<Self>, mut turns: mpsc::UnboundedReceiver<ChatTurn>, outbox: Outbox) {
        while let Some(turn) = turns.recv().await {
            if turn.message.trim().is_empty() {
                debug!("ignoring empty message");
                continue;
            }
            self.interrupted.store(false, Ordering::SeqCst);
            if self.run_turn(turn, &outbox).await.is_err() {
                debug!(session = %self.session.id, "client gone mid-turn");
                return;
            }
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::tests::{controller_with, test_config};
    use crate::sandbox::mock::MockPlatform;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    struct Connection {
        input: mpsc::UnboundedSender<String>,
        output: mpsc::UnboundedReceiver<OutboundMessage>,
        task: tokio::task::JoinHandle<Result<()>>,
        controller: Arc<SandboxController>,
        _catalog_dir: tempfile::TempDir,
    }

    const CATALOG: &str = r#"
[[sessions]]
id = "s1"
account_id = "acct"

[[files]]
id = "f1"
session_id = "s1"
name = "report.csv"

[[files]]
id = "f2"
session_id = "other"
name = "secret.csv"
"#;

    fn connect_with(config: Config, platform: Arc<MockPlatform>) -> Connection {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.toml");
        std::fs::write(&catalog_path, CATALOG).unwrap();

        let controller = Arc::new(controller_with(config, platform));
        let relay = Relay::new(controller.clone(), Catalog::new(catalog_path), Session::new("acct", "s1"));
        let (input, input_rx) = mpsc::unbounded_channel::<String>();
        let inbound = futures_util::stream::unfold(input_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        let (outbox, output) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay.run(inbound, outbox));
        Connection {
            input,
            output,
            task,
            controller,
            _catalog_dir: dir,
        }
    }

    fn connect(config: Config) -> Connection {
        connect_with(config, Arc::new(MockPlatform::new()))
    }

    fn scripted(reply: &str) -> Config {
        let mut config = test_config();
        config.agent.scripted.reply = reply.to_string();
        config
    }

    impl Connection {
        fn send(&self, frame: serde_json::Value) {
            self.input.send(frame.to_string()).unwrap();
        }

        async fn next(&mut self) -> OutboundMessage {
            timeout(Duration::from_secs(10), self.output.recv())
                .await
                .expect("relay went quiet")
                .expect("relay closed")
        }

        /// Messages up to and including the next completion.
        async fn until_complete(&mut self) -> (Vec<StreamEvent>, String) {
            let mut events = Vec::new();
            loop {
                match self.next().await {
                    OutboundMessage::Stream { event, .. } => events.push(event),
                    OutboundMessage::Complete { content, role, .. } => {
                        assert_eq!(role, "assistant");
                        return (events, content);
                    }
                }
            }
        }

        async fn close(self) {
            drop(self.input);
            timeout(Duration::from_secs(10), self.task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    fn texts(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Worker(WorkerEvent::Text { content }) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command(r#"{"type":"stop"}"#).unwrap(), ClientCommand::Stop);
        assert_eq!(
            parse_command(r#"{"message":"hi","file_ids":["f1"]}"#).unwrap(),
            ClientCommand::Chat {
                message: "hi".to_string(),
                file_ids: vec!["f1".to_string()],
            }
        );
        assert_eq!(
            parse_command(r#"{"type":"message","message":"hi"}"#).unwrap(),
            ClientCommand::Chat {
                message: "hi".to_string(),
                file_ids: Vec::new(),
            }
        );
        assert!(parse_command("not json").is_err());
        assert!(parse_command(r#"{"file_ids":[]}"#).is_err());
    }

    #[test]
    fn test_outbound_wire_format() {
        let stream = serde_json::to_value(OutboundMessage::stream(WorkerEvent::text("4"))).unwrap();
        assert_eq!(stream["type"], "stream");
        assert_eq!(stream["event"], json!({"type": "text", "content": "4"}));
        assert!(chrono::DateTime::parse_from_rfc3339(stream["timestamp"].as_str().unwrap()).is_ok());

        let status =
            serde_json::to_value(OutboundMessage::stream(ControlEvent::SandboxStatus { is_new: true })).unwrap();
        assert_eq!(status["event"], json!({"type": "sandbox_status", "is_new": true}));

        let ack = serde_json::to_value(OutboundMessage::stream(ControlEvent::StopAcknowledged {
            result: InterruptReport {
                interrupted: true,
                sandbox_name: "agent-acct-s1".to_string(),
                message: "Interrupt signal sent to agent".to_string(),
            },
        }))
        .unwrap();
        assert_eq!(
            ack["event"],
            json!({
                "type": "stop_acknowledged",
                "interrupted": true,
                "sandbox_name": "agent-acct-s1",
                "message": "Interrupt signal sent to agent",
            })
        );

        let complete = serde_json::to_value(OutboundMessage::complete("4")).unwrap();
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["role"], "assistant");
        assert_eq!(complete["content"], "4");
    }

    #[tokio::test]
    async fn test_simple_question_streams_and_completes() {
        let mut conn = connect(scripted("4"));
        conn.send(json!({"message": "2+2?"}));

        let (events, content) = conn.until_complete().await;
        assert!(events.contains(&StreamEvent::Control(ControlEvent::SandboxStatus { is_new: true })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Worker(WorkerEvent::Timing { phase, .. }) if phase == "start_worker")));
        assert_eq!(texts(&events), vec!["4"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Worker(WorkerEvent::Result { .. }))));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Worker(WorkerEvent::Done { interrupted: None }))
        );
        assert_eq!(content, "4");

        conn.close().await;
    }

    #[tokio::test]
    async fn test_sequential_turns_reuse_sandbox() {
        let mut conn = connect(scripted("You said: {message}"));
        conn.send(json!({"message": "one"}));
        conn.send(json!({"message": "two"}));

        let (first_events, first) = conn.until_complete().await;
        let (second_events, second) = conn.until_complete().await;
        assert_eq!(first, "You said: one");
        assert_eq!(second, "You said: two");
        assert!(second_events.contains(&StreamEvent::Control(ControlEvent::SandboxStatus { is_new: false })));
        for events in [&first_events, &second_events] {
            assert!(!events
                .iter()
                .any(|e| matches!(e, StreamEvent::Worker(WorkerEvent::Error { .. }))));
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn test_stop_mid_turn() {
        let mut config = scripted(&"once upon ".repeat(4));
        config.agent.scripted.chunks = 20;
        config.agent.scripted.step_delay_ms = 50;
        let mut conn = connect(config);
        conn.send(json!({"message": "tell me a story"}));

        let mut events = Vec::new();
        loop {
            let OutboundMessage::Stream { event, .. } = conn.next().await else {
                panic!("completed before any text");
            };
            let is_text = matches!(event, StreamEvent::Worker(WorkerEvent::Text { .. }));
            events.push(event);
            if is_text {
                break;
            }
        }

        let stopped_at = Instant::now();
        conn.send(json!({"type": "stop"}));
        let mut interrupted_after = None;
        let content = loop {
            match conn.next().await {
                OutboundMessage::Stream { event, .. } => {
                    if matches!(event, StreamEvent::Worker(WorkerEvent::Interrupted { .. })) {
                        interrupted_after = Some(stopped_at.elapsed());
                    }
                    events.push(event);
                }
                OutboundMessage::Complete { content, .. } => break content,
            }
        };

        let ack = events.iter().find_map(|e| match e {
            StreamEvent::Control(ControlEvent::StopAcknowledged { result }) => Some(result.clone()),
            _ => None,
        });
        assert!(ack.unwrap().interrupted);
        assert!(interrupted_after.unwrap() < Duration::from_millis(250));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Worker(WorkerEvent::Done { interrupted: Some(true) }))
        );

        let so_far = texts(&events);
        assert!(!so_far.is_empty() && so_far.len() < 20);
        assert_eq!(content, so_far.join("\n\n"));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_interrupt_from_control_endpoint_marks_turn_stopped() {
        let mut config = scripted("slow answer");
        config.agent.scripted.chunks = 4;
        config.agent.scripted.step_delay_ms = 500;
        let mut conn = connect(config);
        conn.send(json!({"message": "take your time"}));

        let mut events = Vec::new();
        loop {
            let OutboundMessage::Stream { event, .. } = conn.next().await else {
                panic!("completed before the agent started");
            };
            let started = matches!(event, StreamEvent::Worker(WorkerEvent::Init { .. }));
            events.push(event);
            if started {
                break;
            }
        }

        let report = conn.controller.interrupt(&Session::new("acct", "s1")).await.unwrap();
        assert!(report.interrupted);

        let (rest, content) = conn.until_complete().await;
        events.extend(rest);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Worker(WorkerEvent::Interrupted { .. }))));
        assert!(texts(&events).is_empty());
        assert_eq!(content, "[Stopped by user]");

        conn.close().await;
    }

    #[tokio::test]
    async fn test_stop_before_submission() {
        let platform = Arc::new(MockPlatform::with_worker_delay(Duration::from_millis(500)));
        let mut conn = connect_with(scripted("never sent"), platform);
        conn.send(json!({"message": "hello"}));

        loop {
            if let OutboundMessage::Stream {
                event: StreamEvent::Control(ControlEvent::SandboxStatus { .. }),
                ..
            } = conn.next().await
            {
                break;
            }
        }
        conn.send(json!({"type": "stop"}));

        let (events, content) = conn.until_complete().await;
        assert_eq!(content, "[Stopped by user]");
        assert!(texts(&events).is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Control(ControlEvent::StopAcknowledged { .. }))));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_invalid_frame_keeps_connection_open() {
        let mut conn = connect(scripted("fine"));
        conn.input.send("not json".to_string()).unwrap();

        let OutboundMessage::Stream { event, .. } = conn.next().await else {
            panic!("expected an error event");
        };
        assert!(matches!(event, StreamEvent::Worker(WorkerEvent::Error { message }) if message.starts_with("Invalid message")));

        conn.send(json!({"message": "still there?"}));
        let (_, content) = conn.until_complete().await;
        assert_eq!(content, "fine");

        conn.close().await;
    }

    #[tokio::test]
    async fn test_empty_message_is_not_a_turn() {
        let mut conn = connect(scripted("answered"));
        conn.send(json!({"message": "   "}));
        conn.send(json!({"message": "real question"}));

        let (_, content) = conn.until_complete().await;
        assert_eq!(content, "answered");
        conn.close().await;
    }

    #[tokio::test]
    async fn test_referenced_files_are_injected() {
        let mut conn = connect(scripted("{message}"));
        conn.send(json!({"message": "summarize", "file_ids": ["f1", "f2"]}));

        let (_, content) = conn.until_complete().await;
        assert!(content.starts_with("[REFERENCED FILES]\n"));
        assert!(content.contains("/data/report.csv"));
        assert!(!content.contains("secret.csv"));
        assert!(content.ends_with("[END REFERENCED FILES]\n\nsummarize"));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_sandbox_failure_reports_error_completion() {
        let platform = Arc::new(MockPlatform::new());
        platform.fail_create(true);
        let mut conn = connect_with(scripted("unused"), platform);
        conn.send(json!({"message": "hi"}));

        let (events, content) = conn.until_complete().await;
        assert!(matches!(events.last(), Some(StreamEvent::Worker(WorkerEvent::Error { .. }))));
        assert!(content.starts_with("Error: "));
        assert!(content.contains("quota exceeded"));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_relay_ends_when_client_leaves() {
        let conn = connect(scripted("unused"));
        conn.close().await;
    }
}
