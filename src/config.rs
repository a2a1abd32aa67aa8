use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::agent::Provider;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "agentbox.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Chat relay and control endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path of the session/file catalog (TOML)
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,

    /// Account used by CLI commands when `--account` is not given
    #[serde(default = "default_account")]
    pub default_account: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            catalog: default_catalog(),
            default_account: default_account(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_catalog() -> PathBuf {
    PathBuf::from("catalog.toml")
}

fn default_account() -> String {
    "demo-account-001".to_string()
}

/// Agent configuration - selects and configures the agent the worker drives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Which agent provider to use: "claude" or "scripted"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Claude-specific configuration
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Scripted replies, for demos and tests
    #[serde(default)]
    pub scripted: ScriptedConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            claude: ClaudeConfig::default(),
            scripted: ScriptedConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parse the provider string into a Provider enum
    pub fn get_provider(&self) -> Result<Provider> {
        self.provider.parse()
    }
}

fn default_provider() -> String {
    "claude".to_string()
}

/// Claude Code CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Path to the Claude CLI
    /// - Default: "claude"
    /// - Custom: "/path/to/claude"
    #[serde(default = "default_claude_path")]
    pub path: String,

    /// Model to use (optional)
    /// - Examples: "opus", "sonnet"
    #[serde(default)]
    pub model: Option<String>,

    /// Text appended to the agent's system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Cap on agent turns per request
    #[serde(default)]
    pub max_turns: Option<u32>,

    /// Tools the agent may use without asking
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,

    /// Permission mode passed to the CLI
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            path: default_claude_path(),
            model: None,
            system_prompt: None,
            max_turns: None,
            allowed_tools: default_allowed_tools(),
            permission_mode: default_permission_mode(),
        }
    }
}

fn default_claude_path() -> String {
    "claude".to_string()
}

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Edit", "Bash", "Glob", "Grep"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_permission_mode() -> String {
    "acceptEdits".to_string()
}

/// Scripted agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Reply text; `{message}` is replaced by the user message
    #[serde(default = "default_reply")]
    pub reply: String,

    /// Number of text events the reply is split into
    #[serde(default = "default_chunks")]
    pub chunks: usize,

    /// Delay before each text event
    #[serde(default)]
    pub step_delay_ms: u64,

    /// Announce a tool call with this name before replying
    #[serde(default)]
    pub tool: Option<String>,

    /// Fail every turn with this message
    #[serde(default)]
    pub fail_with: Option<String>,
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            reply: default_reply(),
            chunks: default_chunks(),
            step_delay_ms: 0,
            tool: None,
            fail_with: None,
        }
    }
}

fn default_reply() -> String {
    "You said: {message}".to_string()
}

fn default_chunks() -> usize {
    1
}

/// Where sandboxes run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    #[default]
    Docker,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Sandbox backend
    #[serde(default)]
    pub backend: Backend,

    /// Host directory for IPC directories and agent state
    /// - Default: ~/.agentbox
    #[serde(default)]
    pub state_dir: Option<String>,

    /// Host directory holding per-account, per-session data
    /// - Default: <state_dir>/workspace
    #[serde(default)]
    pub data_root: Option<String>,

    /// Docker image to use
    #[serde(default = "default_image")]
    pub image: String,

    /// Additional volume mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Copy the worker binary into each new sandbox
    #[serde(default = "default_true")]
    pub provision_binary: bool,

    /// Worker binary to provision (default: the running executable)
    #[serde(default)]
    pub worker_binary: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            state_dir: None,
            data_root: None,
            image: default_image(),
            mounts: Vec::new(),
            network: NetworkConfig::default(),
            resources: ResourceConfig::default(),
            provision_binary: true,
            worker_binary: None,
        }
    }
}

impl SandboxConfig {
    /// Resolved host state directory
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand_path(dir),
            None => dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".agentbox"),
        }
    }

    /// Resolved host data root
    pub fn data_root(&self) -> PathBuf {
        match &self.data_root {
            Some(dir) => expand_path(dir),
            None => self.state_dir().join("workspace"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    #[default]
    AllowAll,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network policy
    #[serde(default)]
    pub policy: NetworkPolicy,

    /// Custom DNS servers
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::AllowAll,
            dns: default_dns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "4g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Sandboxes are recycled by the platform after this long
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_minutes: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            max_lifetime_minutes: default_max_lifetime(),
        }
    }
}

/// Polling intervals and timeouts of the worker protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// How often the worker checks for a new request
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often the controller polls the output log
    #[serde(default = "default_poll_interval")]
    pub request_poll_interval_ms: u64,

    /// How often the worker checks for an interrupt during a turn
    #[serde(default = "default_interrupt_poll_interval")]
    pub interrupt_poll_interval_ms: u64,

    /// Give up on a turn after this long without new output
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Wait this long for a freshly started worker
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Wait this long when warming ahead of a turn
    #[serde(default = "default_prewarm_timeout")]
    pub prewarm_timeout_secs: u64,

    /// Wait this long for a worker in an existing sandbox
    #[serde(default = "default_recheck_timeout")]
    pub recheck_timeout_secs: u64,
}

const MAX_POLL_INTERVAL_MS: u64 = 100;
const MAX_INTERRUPT_POLL_INTERVAL_MS: u64 = 250;

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            request_poll_interval_ms: default_poll_interval(),
            interrupt_poll_interval_ms: default_interrupt_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            ready_timeout_secs: default_ready_timeout(),
            prewarm_timeout_secs: default_prewarm_timeout(),
            recheck_timeout_secs: default_recheck_timeout(),
        }
    }
}

impl WorkerSettings {
    /// Clamp polling intervals to their upper bounds, warning on each change
    pub fn clamped(mut self) -> Self {
        self.poll_interval_ms = clamp_ms("poll_interval_ms", self.poll_interval_ms, MAX_POLL_INTERVAL_MS);
        self.request_poll_interval_ms = clamp_ms(
            "request_poll_interval_ms",
            self.request_poll_interval_ms,
            MAX_POLL_INTERVAL_MS,
        );
        self.interrupt_poll_interval_ms = clamp_ms(
            "interrupt_poll_interval_ms",
            self.interrupt_poll_interval_ms,
            MAX_INTERRUPT_POLL_INTERVAL_MS,
        );
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_poll_interval(&self) -> Duration {
        Duration::from_millis(self.request_poll_interval_ms)
    }

    pub fn interrupt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn prewarm_timeout(&self) -> Duration {
        Duration::from_secs(self.prewarm_timeout_secs)
    }

    pub fn recheck_timeout(&self) -> Duration {
        Duration::from_secs(self.recheck_timeout_secs)
    }
}

fn clamp_ms(field: &str, value: u64, max: u64) -> u64 {
    if value > max {
        warn!(field, value, max, "poll interval above limit, clamping");
        max
    } else if value == 0 {
        warn!(field, "zero poll interval, using 1 ms");
        1
    } else {
        value
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "agentbox:latest".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_max_lifetime() -> u32 {
    300
}

fn default_poll_interval() -> u64 {
    50
}

fn default_interrupt_poll_interval() -> u64 {
    200
}

fn default_request_timeout() -> u64 {
    120
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_prewarm_timeout() -> u64 {
    30
}

fn default_recheck_timeout() -> u64 {
    30
}

/// Expand `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.worker = config.worker.clamped();

        Ok(config)
    }
}
