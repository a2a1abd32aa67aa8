//! Scripted agent driver.
//!
//! Replays a configured reply as a series of text events, optionally
//! preceded by a tool call, so the whole pipeline can be exercised without
//! a real agent CLI.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentDriver, AgentTurn, TurnSummary};
use crate::config::ScriptedConfig;
use crate::ipc::{EventWriter, WorkerEvent};

/// A driver that answers every message with the configured reply.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedDriver {
    config: ScriptedConfig,
    /// Number of times `run_turn` has been called.
    invocation_count: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    pub fn new(config: ScriptedConfig) -> Self {
        Self {
            config,
            invocation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the number of times `run_turn` was called.
    #[cfg(test)]
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    fn reply_for(&self, message: &str) -> String {
        self.config.reply.replace("{message}", message)
    }
}

/// Split `text` into `parts` pieces of roughly equal length on char
/// boundaries. Empty pieces are dropped.
fn split_chunks(text: &str, parts: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = chars.len().div_ceil(parts.max(1)).max(1);
    chars
        .chunks(size)
        .map(|c| c.iter().collect::<String>())
        .filter(|c| !c.is_empty())
        .collect()
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn run_turn(
        &self,
        turn: AgentTurn<'_>,
        events: &EventWriter,
        cancel: CancellationToken,
    ) -> Result<TurnSummary> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let session_id = turn
            .resume
            .map_or_else(|| format!("scripted-{}", uuid::Uuid::new_v4()), String::from);
        let summary = TurnSummary {
            agent_session_id: Some(session_id.clone()),
        };

        if let Some(ref message) = self.config.fail_with {
            anyhow::bail!("{message}");
        }

        events
            .emit(&WorkerEvent::Init {
                session_id: Some(session_id.clone()),
            })
            .await?;

        if let Some(ref tool) = self.config.tool {
            let tool_use_id = format!("toolu_{count:04}");
            events
                .emit(&WorkerEvent::ToolUse {
                    tool_use_id: tool_use_id.clone(),
                    tool: tool.clone(),
                    input: json!({ "message": turn.message }),
                })
                .await?;
            events
                .emit(&WorkerEvent::ToolResult {
                    tool_use_id,
                    tool: tool.clone(),
                    content: "ok".to_string(),
                    is_error: false,
                })
                .await?;
        }

        let delay = Duration::from_millis(self.config.step_delay_ms);
        for chunk in split_chunks(&self.reply_for(turn.message), self.config.chunks) {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("scripted turn cancelled");
                    return Ok(summary);
                }
                () = sleep(delay) => {}
            }
            events.emit(&WorkerEvent::Text { content: chunk }).await?;
        }

        events
            .emit(&WorkerEvent::Result {
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                num_turns: 1,
                session_id,
                total_cost_usd: None,
            })
            .await?;

        Ok(summary)
    }
}
