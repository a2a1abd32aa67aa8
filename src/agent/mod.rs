//! Agent drivers run by the worker, one per turn
//!
//! This module provides a unified interface for the agents a worker can drive:
//! - Claude: `claude -p --output-format stream-json --verbose`, prompt on stdin
//! - Scripted: canned replies for demos and tests
//!
//! The provider is selected via `[agent].provider` in agentbox.toml.

mod claude;
mod scripted;
mod stream_json;

pub(crate) use claude::ClaudeDriver;
pub(crate) use scripted::ScriptedDriver;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::ipc::EventWriter;

/// One user message to answer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AgentTurn<'a> {
    /// Chat session the message belongs to
    pub app_session_id: &'a str,
    pub message: &'a str,
    /// Agent-side session to continue, if a previous turn recorded one
    pub resume: Option<&'a str>,
    /// Working directory of the agent
    pub cwd: &'a Path,
}

/// What the worker keeps from a finished turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TurnSummary {
    pub agent_session_id: Option<String>,
}

/// Trait for agents the worker can drive.
#[async_trait]
pub(crate) trait AgentDriver: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Answer one message, writing events as they are produced.
    ///
    /// When `cancel` fires the driver stops promptly and returns what it
    /// has; cancellation is not an error.
    async fn run_turn(
        &self,
        turn: AgentTurn<'_>,
        events: &EventWriter,
        cancel: CancellationToken,
    ) -> Result<TurnSummary>;
}

/// Supported agent providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Provider {
    /// Claude Code CLI agent.
    #[default]
    Claude,
    /// Replays a configured reply.
    Scripted,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "scripted" => Ok(Self::Scripted),
            _ => anyhow::bail!("Unknown agent provider: '{s}'. Supported: claude, scripted"),
        }
    }
}

/// Build the driver selected by `config`.
pub(crate) fn build(config: &AgentConfig) -> Result<Arc<dyn AgentDriver>> {
    Ok(match config.get_provider()? {
        Provider::Claude => Arc::new(ClaudeDriver::new(config.claude.clone())),
        Provider::Scripted => Arc::new(ScriptedDriver::new(config.scripted.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display() {
        assert_eq!(format!("{}", Provider::Claude), "claude");
        assert_eq!(format!("{}", Provider::Scripted), "scripted");
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Claude);
        assert_eq!("Scripted".parse::<Provider>().unwrap(), Provider::Scripted);
        assert!("cursor".parse::<Provider>().is_err());
    }

    #[test]
    fn test_build_selects_driver() {
        let mut config = AgentConfig::default();
        assert_eq!(build(&config).unwrap().name(), "Claude");

        config.provider = "scripted".to_string();
        assert_eq!(build(&config).unwrap().name(), "Scripted");

        config.provider = "other".to_string();
        assert!(build(&config).is_err());
    }
}
