//! Proxy settings loaded from an optional YAML file.
//!
//! Every field has a default, so a missing file or an empty one yields a
//! working configuration. CLI flags override what is read here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::errors::ProxyError;
use crate::proxy::handle::HandleTimeouts;
use crate::proxy::loader::CoreOptions;

/// File name searched for when no settings path is given.
pub const SETTINGS_FILE_NAME: &str = "mcp-proxy.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// `.mcp.json` holding the server table. Defaults to `./.mcp.json`.
    pub config_file: Option<PathBuf>,
    /// Where the installer clones repositories. Defaults to `~/.mcp_servers`.
    pub install_dir: Option<PathBuf>,
    /// Python interpreter used for `pip install` and new `.mcp.json` entries.
    pub python: Option<String>,
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub auto_load_on_call: bool,
    pub search_max_results: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            config_file: None,
            install_dir: None,
            python: None,
            handshake_timeout_ms: 30_000,
            call_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            auto_load_on_call: false,
            search_max_results: 10,
        }
    }
}

impl ProxySettings {
    /// Parse a settings file. An empty file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ProxyError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse(&raw).map_err(|e| ProxyError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
    }

    fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Load from `path` if given, else from the first `mcp-proxy.yaml`
    /// found walking upward from `start`, else defaults.
    pub fn discover(path: Option<&Path>, start: &Path) -> Result<Self, ProxyError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match find_settings_path(start) {
            Some(found) => {
                tracing::debug!(path = %found.display(), "using settings file");
                Self::load(&found)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".mcp.json")
        })
    }

    pub fn install_path(&self) -> PathBuf {
        self.install_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mcp_servers")
        })
    }

    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            timeouts: HandleTimeouts {
                handshake: Duration::from_millis(self.handshake_timeout_ms),
                shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            },
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            auto_load_on_call: self.auto_load_on_call,
        }
    }
}

/// Walk upward from `start` looking for `mcp-proxy.yaml`.
pub fn find_settings_path(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(SETTINGS_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
