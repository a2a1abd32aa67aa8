//! Driving one chat turn from the processor task.

use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

use super::{send, ChatTurn, ClientGone, ControlEvent, OutboundMessage, Outbox, Relay};
use crate::catalog::CatalogFile;
use crate::ipc::{IpcError, WorkerEvent, WorkerRequest};
use crate::sandbox::SandboxError;

const STOPPED_BY_USER: &str = "[Stopped by user]";
const TASK_COMPLETED: &str = "Task completed.";

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error(transparent)]
    ClientGone(#[from] ClientGone),

    #[error(transparent)]
    Catalog(#[from] anyhow::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Prefix `message` with the list of files the user referenced.
fn with_file_preamble(data_dir: &Path, files: &[CatalogFile], message: &str) -> String {
    if files.is_empty() {
        return message.to_string();
    }
    let mut lines = vec![
        "[REFERENCED FILES]".to_string(),
        "The user has specifically referenced these files. Read them directly without listing first:"
            .to_string(),
    ];
    lines.extend(
        files
            .iter()
            .map(|f| format!("- {}", data_dir.join(&f.name).display())),
    );
    lines.push("[END REFERENCED FILES]".to_string());
    lines.push(String::new());
    lines.push(message.to_string());
    lines.join("\n")
}

/// Content of the completion message for a turn that ran to its end.
fn transcript(texts: &[String], interrupted: bool) -> String {
    if !texts.is_empty() {
        texts.join("\n\n")
    } else if interrupted {
        STOPPED_BY_USER.to_string()
    } else {
        TASK_COMPLETED.to_string()
    }
}

impl Relay {
    /// Run one turn and send exactly one completion for it.
    pub(super) async fn run_turn(&self, turn: ChatTurn, outbox: &Outbox) -> Result<(), ClientGone> {
        let mut texts = Vec::new();
        let content = match self.drive(&turn, outbox, &mut texts).await {
            Ok(()) => transcript(&texts, self.is_interrupted()),
            Err(TurnError::ClientGone(gone)) => return Err(gone),
            Err(e) => {
                warn!(session = %self.session.id, error = %e, "turn failed");
                send(outbox, OutboundMessage::stream(WorkerEvent::error(e.to_string())))?;
                format!("Error: {e}")
            }
        };
        send(outbox, OutboundMessage::complete(content))
    }

    async fn drive(
        &self,
        turn: &ChatTurn,
        outbox: &Outbox,
        texts: &mut Vec<String>,
    ) -> Result<(), TurnError> {
        let files = self.catalog.files_for(&self.session.id, &turn.file_ids).await?;
        let message = with_file_preamble(&self.controller.data_dir(&self.session), &files, &turn.message);

        let provisioned = self.controller.lookup_or_create(&self.session).await?;
        for event in provisioned.trace.events() {
            send(outbox, OutboundMessage::stream(event))?;
        }
        send(
            outbox,
            OutboundMessage::stream(ControlEvent::SandboxStatus {
                is_new: provisioned.is_new,
            }),
        )?;
        let mut trace = provisioned.trace;

        let settings = &self.controller.config().worker;
        let ipc = self.controller.worker(&provisioned.handle);
        let started = Instant::now();
        let ready_timeout = if provisioned.is_new {
            settings.ready_timeout()
        } else {
            settings.recheck_timeout()
        };
        ipc.wait_ready(ready_timeout).await?;
        send(outbox, OutboundMessage::stream(trace.record("worker_ready", started)))?;

        if self.is_interrupted() {
            info!(session = %self.session.id, "stopped before the request was sent");
            return Ok(());
        }

        let request = WorkerRequest::new(&self.session.id, message);
        let started = Instant::now();
        ipc.submit(&request).await?;
        send(outbox, OutboundMessage::stream(trace.record("request_submit", started)))?;

        let events = ipc.poll_stream(&request.request_id, settings.request_timeout());
        futures_util::pin_mut!(events);
        let started = Instant::now();
        let mut awaiting_output = true;
        while let Some(event) = events.next().await {
            let event = event?;
            if awaiting_output {
                awaiting_output = false;
                send(outbox, OutboundMessage::stream(trace.record("first_output", started)))?;
            }
            match &event {
                WorkerEvent::Text { content } => texts.push(content.clone()),
                // Stops raised outside this connection arrive only as this event.
                WorkerEvent::Interrupted { .. } => self.interrupted.store(true, Ordering::SeqCst),
                _ => {}
            }
            send(outbox, OutboundMessage::stream(event))?;
        }

        info!(
            session = %self.session.id,
            request_id = %request.request_id,
            timings = %trace.summary(),
            "turn complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> CatalogFile {
        CatalogFile {
            id: format!("id-{name}"),
            session_id: "s1".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_preamble_lists_files() {
        let message = with_file_preamble(
            Path::new("/data"),
            &[file("report.csv"), file("notes.md")],
            "compare these",
        );
        assert_eq!(
            message,
            "[REFERENCED FILES]\n\
             The user has specifically referenced these files. Read them directly without listing first:\n\
             - /data/report.csv\n\
             - /data/notes.md\n\
             [END REFERENCED FILES]\n\
             \n\
             compare these"
        );
    }

    #[test]
    fn test_no_files_leaves_message_alone() {
        assert_eq!(with_file_preamble(Path::new("/data"), &[], "hi"), "hi");
    }

    #[test]
    fn test_transcript_variants() {
        let texts = vec!["first".to_string(), "second".to_string()];
        assert_eq!(transcript(&texts, false), "first\n\nsecond");
        assert_eq!(transcript(&texts, true), "first\n\nsecond");
        assert_eq!(transcript(&[], true), "[Stopped by user]");
        assert_eq!(transcript(&[], false), "Task completed.");
    }

    #[test]
    fn test_turn_error_messages() {
        let err = TurnError::from(IpcError::RequestConflict);
        assert_eq!(format!("Error: {err}"), "Error: Worker is busy with another request");
        let err = TurnError::from(SandboxError::container_failed("quota exceeded"));
        assert_eq!(err.to_string(), "Container operation failed: quota exceeded");
    }
}
