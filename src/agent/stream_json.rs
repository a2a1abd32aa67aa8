//! Decoder for the Claude CLI `--output-format stream-json` protocol.
//!
//! Each stdout line is one JSON message. Only the messages and content
//! blocks we forward are modelled; anything else decodes to `Other` and is
//! dropped.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::ipc::WorkerEvent;

/// Tool output longer than this is cut before it reaches the client.
pub(crate) const TOOL_RESULT_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: MessageBody,
    },
    User {
        message: MessageBody,
    },
    Result {
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

/// Turns CLI output lines into worker events.
///
/// Tool names are remembered from `tool_use` blocks so the matching
/// `tool_result` can be labelled.
#[derive(Debug, Default)]
pub(crate) struct Translator {
    pending_tools: HashMap<String, String>,
    session_id: Option<String>,
}

impl Translator {
    /// The agent session id announced by the CLI, once seen.
    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn translate(&mut self, line: &str) -> Vec<WorkerEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let message = match serde_json::from_str::<CliMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "non-protocol agent output");
                return vec![WorkerEvent::text(line)];
            }
        };

        match message {
            CliMessage::System {
                subtype,
                session_id,
            } if subtype.as_deref() == Some("init") => {
                if session_id.is_some() {
                    self.session_id.clone_from(&session_id);
                }
                vec![WorkerEvent::Init { session_id }]
            }
            CliMessage::Assistant { message } | CliMessage::User { message } => {
                self.translate_content(message.content)
            }
            CliMessage::Result {
                duration_ms,
                num_turns,
                session_id,
                total_cost_usd,
            } => {
                if !session_id.is_empty() {
                    self.session_id = Some(session_id.clone());
                }
                vec![WorkerEvent::Result {
                    duration_ms,
                    num_turns,
                    session_id,
                    total_cost_usd,
                }]
            }
            CliMessage::System { .. } | CliMessage::Other => Vec::new(),
        }
    }

    fn translate_content(&mut self, content: MessageContent) -> Vec<WorkerEvent> {
        let MessageContent::Blocks(blocks) = content else {
            return Vec::new();
        };
        blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => Some(WorkerEvent::text(text)),
                ContentBlock::ToolUse { id, name, input } => {
                    self.pending_tools.insert(id.clone(), name.clone());
                    Some(WorkerEvent::ToolUse {
                        tool_use_id: id,
                        tool: name,
                        input,
                    })
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let tool = self
                        .pending_tools
                        .remove(&tool_use_id)
                        .unwrap_or_else(|| "unknown".to_string());
                    Some(WorkerEvent::ToolResult {
                        tool_use_id,
                        tool,
                        content: truncate_content(&content, TOOL_RESULT_LIMIT),
                        is_error: is_error.unwrap_or(false),
                    })
                }
                ContentBlock::Text { .. } | ContentBlock::Other => None,
            })
            .collect()
    }
}

/// Flatten tool output to text and cut it at `limit` characters.
pub(crate) fn truncate_content(content: &Value, limit: usize) -> String {
    let text = match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("text") => {
                    Some(map.get("text").and_then(Value::as_str).unwrap_or_default().to_string())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };

    let total = text.chars().count();
    if total > limit {
        let head: String = text.chars().take(limit).collect();
        format!("{head}... ({total} chars total)")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_captures_session() {
        let mut t = Translator::default();
        let events =
            t.translate(r#"{"type":"system","subtype":"init","session_id":"abc","tools":[]}"#);
        assert_eq!(
            events,
            vec![WorkerEvent::Init {
                session_id: Some("abc".to_string())
            }]
        );
        assert_eq!(t.session_id(), Some("abc"));
    }

    #[test]
    fn test_assistant_blocks_in_order() {
        let mut t = Translator::default();
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/data/a.csv"}}
            ]}
        })
        .to_string();
        let events = t.translate(&line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], WorkerEvent::text("Let me look."));
        assert!(matches!(&events[1], WorkerEvent::ToolUse { tool, .. } if tool == "Read"));
    }

    #[test]
    fn test_tool_result_is_paired_and_truncated() {
        let mut t = Translator::default();
        t.translate(
            &json!({"type": "assistant", "message": {"content": [
                {"type": "tool_use", "id": "toolu_9", "name": "Bash", "input": {"command": "ls"}}
            ]}})
            .to_string(),
        );
        let long = "x".repeat(600);
        let events = t.translate(
            &json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_9", "content": long}
            ]}})
            .to_string(),
        );
        match &events[..] {
            [WorkerEvent::ToolResult {
                tool,
                content,
                is_error,
                ..
            }] => {
                assert_eq!(tool, "Bash");
                assert!(!is_error);
                assert!(content.ends_with("... (600 chars total)"));
                assert!(content.starts_with(&"x".repeat(500)));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_unpaired_tool_result_is_unknown() {
        let mut t = Translator::default();
        let events = t.translate(
            &json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "nope", "content": "ok", "is_error": true}
            ]}})
            .to_string(),
        );
        assert_eq!(
            events,
            vec![WorkerEvent::ToolResult {
                tool_use_id: "nope".to_string(),
                tool: "unknown".to_string(),
                content: "ok".to_string(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_user_prompt_echo_is_ignored() {
        let mut t = Translator::default();
        let events = t.translate(r#"{"type":"user","message":{"role":"user","content":"hi"}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn test_result_message() {
        let mut t = Translator::default();
        let events = t.translate(
            r#"{"type":"result","subtype":"success","duration_ms":812,"num_turns":1,"session_id":"abc","total_cost_usd":0.0123,"result":"4"}"#,
        );
        assert_eq!(
            events,
            vec![WorkerEvent::Result {
                duration_ms: 812,
                num_turns: 1,
                session_id: "abc".to_string(),
                total_cost_usd: Some(0.0123),
            }]
        );
    }

    #[test]
    fn test_unknown_message_type_is_dropped() {
        let mut t = Translator::default();
        assert!(t.translate(r#"{"type":"stream_event","event":{}}"#).is_empty());
        assert!(t.translate("   ").is_empty());
    }

    #[test]
    fn test_non_json_output_becomes_text() {
        let mut t = Translator::default();
        assert_eq!(
            t.translate("Warning: something odd"),
            vec![WorkerEvent::text("Warning: something odd")]
        );
    }

    #[test]
    fn test_truncate_content_shapes() {
        assert_eq!(truncate_content(&Value::Null, 10), "");
        assert_eq!(
            truncate_content(&json!([{"type": "text", "text": "a"}, "b", {"type": "image"}]), 10),
            "a\nb"
        );
        assert_eq!(truncate_content(&json!({"k": 1}), 100), r#"{"k":1}"#);
        assert_eq!(truncate_content(&json!("héllo wörld"), 5), "héllo... (11 chars total)");
    }
}
