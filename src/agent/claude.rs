//! Claude Code agent driver
//!
//! Invokes the Claude CLI in print mode with streaming JSON output:
//! ```bash
//! claude -p --output-format stream-json --verbose --permission-mode acceptEdits \
//!     --allowedTools Read,Write --model opus --resume <session>
//! ```
//!
//! The prompt is piped via stdin. Each stdout line is decoded by
//! [`Translator`] and appended to the output log as it arrives.
//!
//! See: https://docs.anthropic.com/en/docs/claude-code

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream_json::Translator;
use super::{AgentDriver, AgentTurn, TurnSummary};
use crate::config::ClaudeConfig;
use crate::ipc::EventWriter;

/// Claude Code CLI agent driver
pub struct ClaudeDriver {
    config: ClaudeConfig,
}

impl ClaudeDriver {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, resume: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            // stream-json requires verbose in print mode
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            self.config.permission_mode.clone(),
        ];

        if !self.config.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.config.allowed_tools.join(","));
        }

        if let Some(ref model) = self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(ref prompt) = self.config.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }

        if let Some(max_turns) = self.config.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }

        if let Some(session) = resume {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }

        args
    }
}

#[async_trait]
impl AgentDriver for ClaudeDriver {
    fn name(&self) -> &'static str {
        "Claude"
    }

    async fn run_turn(
        &self,
        turn: AgentTurn<'_>,
        events: &EventWriter,
        cancel: CancellationToken,
    ) -> Result<TurnSummary> {
        let claude_path = &self.config.path;
        let args = self.build_args(turn.resume);
        info!(session = turn.app_session_id, resume = ?turn.resume, "Running Claude agent: {}", claude_path);
        debug!("Claude args: {:?}", args);

        let mut child = tokio::process::Command::new(claude_path)
            .current_dir(turn.cwd)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to run Claude agent '{claude_path}'. \n\
                     \n\
                     Make sure Claude Code CLI is installed in the sandbox image:\n\
                     - Install: npm install -g @anthropic-ai/claude-code\n\
                     \n\
                     Configure the path in agentbox.toml:\n\
                     [agent.claude]\n\
                     path = \"claude\"  # Default\n\
                     path = \"/full/path/to/claude\"  # Custom path"
                )
            })?;

        // Claude reads prompt from stdin
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(turn.message.as_bytes()).await?;
            stdin.flush().await?;
        }

        let stdout = child
            .stdout
            .take()
            .context("Claude agent stdout was not captured")?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut translator = Translator::default();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Stopping Claude agent");
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill Claude agent: {}", e);
                    }
                    break;
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        for event in translator.translate(&line) {
                            events.emit(&event).await?;
                        }
                    }
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let summary = TurnSummary {
            agent_session_id: translator.session_id().map(String::from),
        };

        if cancel.is_cancelled() {
            return Ok(summary);
        }

        if !status.success() {
            if stderr.contains("command not found") || stderr.contains("No such file") {
                anyhow::bail!(
                    "Claude agent '{claude_path}' not found.\n\
                     \n\
                     Install Claude Code CLI:\n\
                     - npm install -g @anthropic-ai/claude-code\n\
                     \n\
                     Or configure the path in agentbox.toml:\n\
                     [agent.claude]\n\
                     path = \"/full/path/to/claude\""
                );
            }

            warn!("Agent stderr: {}", stderr);
            anyhow::bail!(
                "Claude agent failed with exit code {:?}:\n{}",
                status.code(),
                stderr.trim()
            );
        }

        info!("Claude agent completed successfully");
        Ok(summary)
    }
}
