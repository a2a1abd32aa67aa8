use serde::{Deserialize, Serialize};

/// Longest name accepted by the isolation platform
const MAX_SANDBOX_NAME: usize = 63;

/// A chat session and the account that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub account_id: String,
}

impl Session {
    pub fn new(account_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
        }
    }

    /// Name of the sandbox serving this session.
    ///
    /// Deterministic, so every connection for a session finds the same
    /// sandbox. Characters the platform rejects (including `.`) become `-`.
    pub fn sandbox_name(&self) -> String {
        format!("agent-{}-{}", self.account_id, self.id)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_SANDBOX_NAME)
            .collect()
    }
}
