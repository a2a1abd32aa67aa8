use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::session::Session;

/// A file uploaded into a session's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub id: String,
    pub session_id: String,
    /// File name inside the session's data directory
    pub name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    files: Vec<CatalogFile>,
}

/// Read-only view of the sessions and files another service owns.
///
/// The file is re-read on every lookup so updates made while the server is
/// running are picked up.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<CatalogData> {
        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("Failed to read catalog: {}", self.path.display()))?;
        if !exists {
            return Ok(CatalogData::default());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read catalog: {}", self.path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog: {}", self.path.display()))
    }

    /// Look up a session by id
    pub async fn session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.load().await?.sessions.into_iter().find(|s| s.id == id))
    }

    /// Resolve `ids` to files of `session_id`, in request order.
    ///
    /// Unknown ids and files belonging to other sessions are skipped.
    pub async fn files_for(&self, session_id: &str, ids: &[String]) -> Result<Vec<CatalogFile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let files = self.load().await?.files;
        Ok(ids
            .iter()
            .filter_map(|id| {
                files
                    .iter()
                    .find(|f| &f.id == id && f.session_id == session_id)
                    .cloned()
            })
            .collect())
    }
}
