//! Proxy error types.

use thiserror::Error;

/// Errors that can occur while loading, reloading, or calling worker servers.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The server name is unknown to the configuration store.
    #[error("server '{name}' not found in configuration")]
    ConfigNotFound { name: String },

    /// Configuration could not be read or parsed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A server process failed to start (OS-level launch failure).
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake or manifest fetch did not complete.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// The worker's output stream carried a malformed frame.
    #[error("framing error from server '{server}': {reason}")]
    Framing { server: String, reason: String },

    /// The worker's stream closed or the process died while a call was pending.
    #[error("server '{name}' is not running: {reason}")]
    WorkerDead { name: String, reason: String },

    /// The deadline elapsed; the worker may still be alive.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The worker answered with an application-level error.
    #[error("server error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool is not part of the worker's manifest.
    #[error("unknown tool '{tool}' on server '{server}'")]
    ToolNotFound {
        server: String,
        tool: String,
        suggestions: Vec<String>,
    },

    /// Tool call arguments failed structural validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A load was requested for a server that is already running.
    #[error("server '{name}' is already loaded")]
    AlreadyLoaded { name: String },

    /// The operation needs a loaded server and there is none under this name.
    #[error("server '{name}' is not loaded")]
    NotLoaded { name: String },

    /// A reload did not produce a working replacement.
    #[error("reload of '{name}' failed ({}): {reason}", kept_note(.previous_kept))]
    ReloadFailed {
        name: String,
        reason: String,
        previous_kept: bool,
    },

    /// Fetching, building, or registering a server package failed.
    #[error("install failed: {reason}")]
    InstallFailed { reason: String },
}

fn kept_note(previous_kept: &bool) -> &'static str {
    if *previous_kept {
        "previous process still serving"
    } else {
        "server removed"
    }
}

impl ProxyError {
    /// Stable, machine-readable name of the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "config_not_found",
            Self::ConfigError { .. } => "config_error",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::HandshakeFailed { .. } => "handshake_failed",
            Self::Framing { .. } => "framing_error",
            Self::WorkerDead { .. } => "worker_dead",
            Self::Timeout { .. } => "timeout",
            Self::Remote { .. } => "remote_error",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::AlreadyLoaded { .. } => "already_loaded",
            Self::NotLoaded { .. } => "not_loaded",
            Self::ReloadFailed { .. } => "reload_failed",
            Self::InstallFailed { .. } => "install_failed",
        }
    }

    /// Whether the failure came from the process/protocol layer rather than
    /// from the tool's own logic or the caller's request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. }
                | Self::HandshakeFailed { .. }
                | Self::Framing { .. }
                | Self::WorkerDead { .. }
                | Self::Timeout { .. }
                | Self::ReloadFailed { .. }
        )
    }
}
