//! The event taxonomy written by the worker, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A single record in the worker's output log.
///
/// `worker_processing` and `request_done` delimit a request on the wire and
/// are never forwarded to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerEvent {
    Init {
        #[serde(default)]
        session_id: Option<String>,
    },
    Text {
        content: String,
    },
    ToolUse {
        tool_use_id: String,
        tool: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Result {
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
    },
    Timing {
        phase: String,
        duration_ms: f64,
        elapsed_ms: f64,
    },
    Interrupted {
        reason: String,
    },
    Error {
        message: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupted: Option<bool>,
    },
    WorkerProcessing {
        #[serde(default)]
        request_id: String,
    },
    RequestDone {},
}

/// Reason attached to interrupts raised by a client stop command.
pub(crate) const USER_REQUESTED: &str = "user_requested";

impl WorkerEvent {
    /// Shorthand for a text event.
    pub(crate) fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Shorthand for an error event.
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// True for the protocol delimiters that stay between controller and worker.
    pub(crate) fn is_internal(&self) -> bool {
        matches!(self, Self::WorkerProcessing { .. } | Self::RequestDone {})
    }

    /// True for events that carry agent output, which stop after an interrupt.
    pub(crate) fn is_agent_output(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::ToolUse { .. })
    }

    /// Serialize as a single NDJSON line, without the trailing newline.
    pub(crate) fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode one output line.
///
/// Lines that are not JSON, or JSON outside the taxonomy, are passed through
/// as text so partial or foreign output is never lost.
pub(crate) fn decode_line(line: &str) -> WorkerEvent {
    match serde_json::from_str::<WorkerEvent>(line) {
        Ok(event) => event,
        Err(err) => {
            debug!(%err, "undecodable worker output line, forwarding as text");
            WorkerEvent::text(line)
        }
    }
}
