//! Server configuration: resolving worker names to launch specs.
//!
//! The proxy reads a Claude-style `.mcp.json`:
//!
//! ```json
//! { "mcpServers": { "fs": { "command": "python3", "args": ["server.py"], "venv": ".venv" } } }
//! ```
//!
//! The file is re-read on every resolve, so a reload picks up edits made
//! since the worker was first loaded. Relative `cwd` values are taken
//! relative to the file's directory, `venv` relative to the server's `cwd`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::errors::ProxyError;
use super::transport::Framing;
use super::types::{LaunchSpec, ReloadStrategy};

// ─── ConfigStore ─────────────────────────────────────────────────────────────

/// Source of launch specs for named workers.
pub trait ConfigStore: Send + Sync {
    /// Resolve a worker name to the spec used to launch it.
    fn resolve(&self, name: &str) -> Result<LaunchSpec, ProxyError>;

    /// Names of every configured worker, sorted.
    fn available(&self) -> Result<Vec<String>, ProxyError>;
}

// ─── File Format ─────────────────────────────────────────────────────────────

/// One server entry in `.mcp.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Optional Python virtual environment path. When set, `command` is resolved
    /// to `{venv}/bin/{command}` and `VIRTUAL_ENV` + `PATH` are injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<String>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub framing: Framing,
    /// Send at most one request at a time to this worker.
    #[serde(default, alias = "serializeCalls", skip_serializing_if = "is_default")]
    pub serialize_calls: bool,
    #[serde(default, alias = "reloadStrategy", skip_serializing_if = "is_default")]
    pub reload_strategy: ReloadStrategy,
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// The whole `.mcp.json` document. Unknown top-level keys are preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpJson {
    #[serde(default, rename = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerConfig {
    /// Build a launch spec, resolving paths against `base_dir`.
    pub fn to_launch_spec(&self, name: &str, base_dir: &Path) -> LaunchSpec {
        let cwd = self.cwd.as_ref().map(|cwd| {
            let cwd = PathBuf::from(expand_env(cwd));
            if cwd.is_absolute() {
                cwd
            } else {
                base_dir.join(cwd)
            }
        });

        let mut spec = LaunchSpec::new(name, expand_env(&self.command));
        spec.args = self.args.iter().map(|a| expand_env(a)).collect();
        spec.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect();
        spec.cwd = cwd;
        spec.framing = self.framing;
        spec.serialize_calls = self.serialize_calls;
        spec.reload_strategy = self.reload_strategy;

        if let Some(venv) = &self.venv {
            let venv_base = spec.cwd.clone().unwrap_or_else(|| base_dir.to_path_buf());
            apply_venv(&mut spec, &venv_base, &expand_env(venv));
        }
        spec
    }
}

/// Rewrite the command to the venv's binary and inject the venv environment.
fn apply_venv(spec: &mut LaunchSpec, base_dir: &Path, venv: &str) {
    let abs_venv = if Path::new(venv).is_absolute() {
        PathBuf::from(venv)
    } else {
        base_dir.join(venv)
    };
    // Windows venvs use Scripts\ instead of bin/
    let venv_bin = if cfg!(target_os = "windows") {
        abs_venv.join("Scripts")
    } else {
        abs_venv.join("bin")
    };
    let venv_command = venv_bin.join(&spec.command);

    if !venv_command.exists() {
        tracing::warn!(
            server = %spec.server_name,
            venv = %abs_venv.display(),
            command = %spec.command,
            "venv binary not found, using command as-is"
        );
        return;
    }

    spec.command = venv_command.to_string_lossy().into_owned();
    spec.env.insert(
        "VIRTUAL_ENV".to_string(),
        abs_venv.to_string_lossy().into_owned(),
    );
    let system_path = spec
        .env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();
    let separator = if cfg!(target_os = "windows") { ';' } else { ':' };
    spec.env.insert(
        "PATH".to_string(),
        format!("{}{separator}{system_path}", venv_bin.to_string_lossy()),
    );
    tracing::debug!(
        server = %spec.server_name,
        venv = %abs_venv.display(),
        command = %spec.command,
        "resolved venv for worker"
    );
}

/// Expand `${VAR}` references from the proxy's environment.
///
/// Unset variables are left as written.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 3 + end]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ─── McpJsonConfig ───────────────────────────────────────────────────────────

/// `ConfigStore` backed by a `.mcp.json` file.
#[derive(Debug, Clone)]
pub struct McpJsonConfig {
    path: PathBuf,
}

impl McpJsonConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory that relative `cwd` values are resolved against.
    fn base_dir(&self) -> PathBuf {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&dir))
                .unwrap_or(dir)
        }
    }

    /// Read and parse the file. A missing file is an empty config.
    pub fn read(&self) -> Result<McpJson, ProxyError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(McpJson::default()),
            Err(e) => {
                return Err(ProxyError::ConfigError {
                    reason: format!("failed to read {}: {e}", self.path.display()),
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(McpJson::default());
        }
        serde_json::from_str(&content).map_err(|e| ProxyError::ConfigError {
            reason: format!("failed to parse {}: {e}", self.path.display()),
        })
    }

    pub fn server(&self, name: &str) -> Result<Option<ServerConfig>, ProxyError> {
        Ok(self.read()?.servers.remove(name))
    }

    /// Add or replace a server entry, keeping everything else in the file.
    pub fn upsert_server(&self, name: &str, server: ServerConfig) -> Result<(), ProxyError> {
        let mut doc = self.read()?;
        doc.servers.insert(name.to_string(), server);
        self.write(&doc)?;
        tracing::info!(server = name, path = %self.path.display(), "server registered in config");
        Ok(())
    }

    /// Remove a server entry. Returns the removed entry, if there was one.
    pub fn remove_server(&self, name: &str) -> Result<Option<ServerConfig>, ProxyError> {
        let mut doc = self.read()?;
        let removed = doc.servers.remove(name);
        if removed.is_some() {
            self.write(&doc)?;
            tracing::info!(server = name, path = %self.path.display(), "server removed from config");
        }
        Ok(removed)
    }

    /// Write via a temp file and rename so readers never see a partial file.
    fn write(&self, doc: &McpJson) -> Result<(), ProxyError> {
        let io_err = |what: &str, e: std::io::Error| ProxyError::ConfigError {
            reason: format!("failed to {what} {}: {e}", self.path.display()),
        };

        let mut content = serde_json::to_string_pretty(doc).map_err(|e| ProxyError::ConfigError {
            reason: format!("failed to serialize config: {e}"),
        })?;
        content.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_err("create directory for", e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| io_err("write", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err("replace", e))
    }
}

impl ConfigStore for McpJsonConfig {
    fn resolve(&self, name: &str) -> Result<LaunchSpec, ProxyError> {
        let server = self.server(name)?.ok_or_else(|| ProxyError::ConfigNotFound {
            name: name.to_string(),
        })?;
        Ok(server.to_launch_spec(name, &self.base_dir()))
    }

    fn available(&self) -> Result<Vec<String>, ProxyError> {
        Ok(self.read()?.servers.into_keys().collect())
    }
}

// ─── MemoryConfigStore ───────────────────────────────────────────────────────

/// In-memory `ConfigStore` for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    specs: RwLock<BTreeMap<String, LaunchSpec>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec under its `server_name`, replacing any previous one.
    pub fn insert(&self, spec: LaunchSpec) {
        self.specs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(spec.server_name.clone(), spec);
    }

    pub fn remove(&self, name: &str) -> Option<LaunchSpec> {
        self.specs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn resolve(&self, name: &str) -> Result<LaunchSpec, ProxyError> {
        self.specs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::ConfigNotFound {
                name: name.to_string(),
            })
    }

    fn available(&self) -> Result<Vec<String>, ProxyError> {
        Ok(self
            .specs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> McpJsonConfig {
        let path = dir.path().join(".mcp.json");
        std::fs::write(&path, content).unwrap();
        McpJsonConfig::new(path)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let config = McpJsonConfig::new(dir.path().join(".mcp.json"));
        assert!(config.available().unwrap().is_empty());
        assert!(matches!(
            config.resolve("fs"),
            Err(ProxyError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "{ not json");
        assert!(matches!(config.available(), Err(ProxyError::ConfigError { .. })));
    }

    #[test]
    fn test_resolve_relative_cwd_and_options() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            &dir,
            r#"{
                "mcpServers": {
                    "notes": {
                        "command": "python3",
                        "args": ["server.py", "--verbose"],
                        "env": {"NOTES_DIR": "/tmp/notes"},
                        "cwd": "servers/notes",
                        "framing": "content_length",
                        "serializeCalls": true,
                        "reload_strategy": "restart"
                    },
                    "echo": {"command": "echo-server"}
                }
            }"#,
        );

        assert_eq!(config.available().unwrap(), vec!["echo", "notes"]);

        let spec = config.resolve("notes").unwrap();
        assert_eq!(spec.server_name, "notes");
        assert_eq!(spec.command, "python3");
        assert_eq!(spec.args, vec!["server.py", "--verbose"]);
        assert_eq!(spec.env["NOTES_DIR"], "/tmp/notes");
        assert_eq!(spec.cwd, Some(dir.path().join("servers/notes")));
        assert_eq!(spec.framing, Framing::ContentLength);
        assert!(spec.serialize_calls);
        assert_eq!(spec.reload_strategy, ReloadStrategy::Restart);

        let echo = config.resolve("echo").unwrap();
        assert_eq!(echo.framing, Framing::Line);
        assert_eq!(echo.reload_strategy, ReloadStrategy::Overlap);
        assert!(echo.cwd.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_venv_resolution() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("srv/.venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python3"), "").unwrap();

        let config = write_config(
            &dir,
            r#"{"mcpServers": {"srv": {"command": "python3", "cwd": "srv", "venv": ".venv"}}}"#,
        );
        let spec = config.resolve("srv").unwrap();
        assert_eq!(spec.command, bin.join("python3").to_string_lossy());
        assert_eq!(
            spec.env["VIRTUAL_ENV"],
            dir.path().join("srv/.venv").to_string_lossy()
        );
        assert!(spec.env["PATH"].starts_with(&*bin.to_string_lossy()));
    }

    #[test]
    fn test_missing_venv_keeps_command() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            &dir,
            r#"{"mcpServers": {"srv": {"command": "python3", "venv": "nope"}}}"#,
        );
        let spec = config.resolve("srv").unwrap();
        assert_eq!(spec.command, "python3");
        assert!(!spec.env.contains_key("VIRTUAL_ENV"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("MCP_PROXY_TEST_TOKEN", "s3cret");
        assert_eq!(expand_env("Bearer ${MCP_PROXY_TEST_TOKEN}"), "Bearer s3cret");
        assert_eq!(
            expand_env("${MCP_PROXY_TEST_UNSET_VARIABLE}/x"),
            "${MCP_PROXY_TEST_UNSET_VARIABLE}/x"
        );
        assert_eq!(expand_env("no vars ${unterminated"), "no vars ${unterminated");
    }

    #[test]
    fn test_upsert_and_remove_preserve_other_keys() {
        let dir = TempDir::new().unwrap();
        let config = write_config(
            &dir,
            r#"{"mcpServers": {"old": {"command": "old-server"}}, "theme": "dark"}"#,
        );

        config
            .upsert_server(
                "new",
                ServerConfig {
                    command: "python3".into(),
                    args: vec!["/srv/new/server.py".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let doc = config.read().unwrap();
        assert_eq!(doc.extra["theme"], "dark");
        assert_eq!(doc.servers.len(), 2);

        let raw = std::fs::read_to_string(config.path()).unwrap();
        assert!(!raw.contains("framing"), "defaults should not be written");

        assert!(config.remove_server("old").unwrap().is_some());
        assert!(config.remove_server("old").unwrap().is_none());
        assert_eq!(config.available().unwrap(), vec!["new"]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryConfigStore::new();
        store.insert(LaunchSpec::new("b", "b-server"));
        store.insert(LaunchSpec::new("a", "a-server"));
        assert_eq!(store.available().unwrap(), vec!["a", "b"]);
        assert_eq!(store.resolve("a").unwrap().command, "a-server");
        assert!(store.remove("a").is_some());
        assert!(matches!(
            store.resolve("a"),
            Err(ProxyError::ConfigNotFound { .. })
        ));
    }
}
