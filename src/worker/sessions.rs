//! Persistent mapping from chat session to agent session.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Agent session ids keyed by chat session id, one file per session.
#[derive(Debug, Clone)]
pub(crate) struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub(crate) fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("sessions"),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.txt"))
    }

    /// The agent session recorded for `session_id`, if any.
    pub(crate) async fn load(&self, session_id: &str) -> Result<Option<String>> {
        let path = self.path_for(session_id);
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub(crate) async fn save(&self, session_id: &str, agent_session_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;
        let path = self.path_for(session_id);
        fs::write(&path, agent_session_id)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
