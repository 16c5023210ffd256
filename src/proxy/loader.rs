//! Proxy core: the operations exposed to the outer command surface.
//!
//! Routes tool calls to the right worker with a bounded timeout and wraps
//! registry mutations in reports for the command layer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::config::ConfigStore;
use super::errors::ProxyError;
use super::handle::HandleTimeouts;
use super::index::SearchHit;
use super::installer::{InstallOutcome, InstallRequest, InstalledServer, Installer, UninstallOutcome};
use super::registry::{RegistryEntry, WorkerRegistry, WorkerStatus};
use super::types::{ToolCallResult, ToolManifestEntry};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Suggestions offered with a `ToolNotFound` error.
const MAX_SUGGESTIONS: usize = 3;

// ─── Options & Reports ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CoreOptions {
    pub timeouts: HandleTimeouts,
    pub call_timeout: Duration,
    /// Load an unloaded server on first call instead of failing with `NotLoaded`.
    pub auto_load_on_call: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            timeouts: HandleTimeouts::default(),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            auto_load_on_call: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub server: String,
    pub pid: Option<u32>,
    pub tool_count: usize,
    pub tools: Vec<ToolSummary>,
    pub manifest_digest: String,
}

impl LoadReport {
    fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            server: entry.name().to_string(),
            pid: entry.handle().pid(),
            tool_count: entry.manifest().len(),
            tools: summarize(entry.manifest()),
            manifest_digest: entry.manifest_digest().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub server: String,
    pub previous_pid: Option<u32>,
    pub pid: Option<u32>,
    pub tool_count: usize,
    pub tools: Vec<ToolSummary>,
    /// The new manifest differs from the previous one.
    pub tools_changed: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ReloadReport {
    fn between(previous: &RegistryEntry, current: &RegistryEntry) -> Self {
        let old_names: BTreeSet<&str> = previous.manifest().iter().map(|t| t.name.as_str()).collect();
        let new_names: BTreeSet<&str> = current.manifest().iter().map(|t| t.name.as_str()).collect();

        Self {
            server: current.name().to_string(),
            previous_pid: previous.handle().pid(),
            pid: current.handle().pid(),
            tool_count: current.manifest().len(),
            tools: summarize(current.manifest()),
            tools_changed: previous.manifest_digest() != current.manifest_digest(),
            added: new_names.difference(&old_names).map(|s| s.to_string()).collect(),
            removed: old_names.difference(&new_names).map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnloadReport {
    pub server: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableServer {
    pub name: String,
    pub loaded: bool,
}

/// What `install_and_load` did after installing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Activation {
    Loaded(LoadReport),
    Reloaded(ReloadReport),
}

fn summarize(manifest: &[ToolManifestEntry]) -> Vec<ToolSummary> {
    manifest
        .iter()
        .map(|t| ToolSummary {
            name: t.name.clone(),
            description: t.description.clone(),
        })
        .collect()
}

// ─── ProxyCore ───────────────────────────────────────────────────────────────

pub struct ProxyCore {
    registry: WorkerRegistry,
    installer: Option<Arc<dyn Installer>>,
    call_timeout: Duration,
    auto_load_on_call: bool,
}

impl ProxyCore {
    pub fn new(config: Arc<dyn ConfigStore>, options: CoreOptions) -> Self {
        Self {
            registry: WorkerRegistry::new(config, options.timeouts),
            installer: None,
            call_timeout: options.call_timeout,
            auto_load_on_call: options.auto_load_on_call,
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    pub async fn load(&self, name: &str) -> Result<LoadReport, ProxyError> {
        let entry = self.registry.load(name).await?;
        Ok(LoadReport::from_entry(&entry))
    }

    pub async fn reload(&self, name: &str) -> Result<ReloadReport, ProxyError> {
        let reloaded = self.registry.reload(name).await?;
        Ok(ReloadReport::between(&reloaded.previous, &reloaded.current))
    }

    /// Re-list a running server's tools without restarting it.
    pub async fn refresh_tools(&self, name: &str) -> Result<ReloadReport, ProxyError> {
        let refreshed = self.registry.refresh(name).await?;
        Ok(ReloadReport::between(&refreshed.previous, &refreshed.current))
    }

    pub async fn unload(&self, name: &str) -> Result<UnloadReport, ProxyError> {
        let entry = self.registry.unload(name).await?;
        Ok(UnloadReport {
            server: entry.name().to_string(),
            pid: entry.handle().pid(),
        })
    }

    /// Loaded server names in load order.
    pub fn list(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn loaded_servers(&self) -> Vec<WorkerStatus> {
        self.registry
            .entries()
            .iter()
            .map(|e| e.status())
            .collect()
    }

    /// Every configured server, flagged with whether it is loaded.
    pub fn available_servers(&self) -> Result<Vec<AvailableServer>, ProxyError> {
        Ok(self
            .registry
            .config()
            .available()?
            .into_iter()
            .map(|name| AvailableServer {
                loaded: self.registry.is_loaded(&name),
                name,
            })
            .collect())
    }

    /// Terminate every worker. Used on proxy exit.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call a tool on a loaded server.
    ///
    /// Steps:
    /// 1. Wait out any in-progress mutation of the server and take a snapshot
    /// 2. Check the tool is in the server's manifest
    /// 3. Validate arguments against the tool's schema
    /// 4. Send `tools/call` with whatever remains of the call timeout
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, ProxyError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.call_timeout;
        let timed_out = || ProxyError::Timeout {
            server: server.to_string(),
            operation: format!("tool '{tool}'"),
            timeout_ms: self.call_timeout.as_millis() as u64,
        };

        // 1. Resolve
        let snapshot = tokio::time::timeout_at(deadline, self.registry.get_for_call(server))
            .await
            .map_err(|_| timed_out())?;
        let entry = match snapshot {
            Some(entry) => entry,
            None if self.auto_load_on_call => self.auto_load(server).await?,
            None => {
                return Err(ProxyError::NotLoaded {
                    name: server.to_string(),
                })
            }
        };

        // 2. Find tool
        let Some(definition) = entry.tool(tool) else {
            let suggestions = self
                .registry
                .with_index(|index| index.suggest(Some(server), tool, MAX_SUGGESTIONS));
            return Err(ProxyError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
                suggestions,
            });
        };

        // 3. Validate
        definition.schema.validate(tool, &arguments)?;
        let arguments = if arguments.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            arguments
        };

        // 4. Dispatch
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        let outcome = entry
            .handle()
            .call_tool(tool, arguments, remaining)
            .await
            .map_err(|e| match e {
                ProxyError::Timeout { .. } => timed_out(),
                other => other,
            });

        let elapsed = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                tracing::debug!(server, tool, elapsed_ms = elapsed, "tool call completed");
                Ok(ToolCallResult {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    result,
                    execution_time_ms: elapsed,
                })
            }
            Err(e) => {
                if e.is_infrastructure() {
                    tracing::warn!(server, tool, elapsed_ms = elapsed, error = %e, "tool call failed");
                } else {
                    tracing::debug!(server, tool, elapsed_ms = elapsed, error = %e, "tool returned an error");
                }
                Err(e)
            }
        }
    }

    async fn auto_load(&self, server: &str) -> Result<Arc<RegistryEntry>, ProxyError> {
        tracing::info!(server, "auto-loading server for call");
        match self.registry.load(server).await {
            Ok(entry) => Ok(entry),
            // Another caller loaded it first.
            Err(ProxyError::AlreadyLoaded { .. }) => {
                self.registry.get(server).ok_or_else(|| ProxyError::NotLoaded {
                    name: server.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        self.registry.with_index(|index| index.search(query, limit))
    }

    pub fn lookup(&self, server: &str, tool: &str) -> Option<ToolManifestEntry> {
        self.registry
            .with_index(|index| index.lookup(server, tool).cloned())
    }

    /// Every loaded tool, in server load order.
    pub fn list_all_tools(&self) -> Vec<ToolManifestEntry> {
        self.registry
            .with_index(|index| index.all_tools().into_iter().cloned().collect())
    }

    /// Definition of a tool by name, optionally restricted to one server.
    ///
    /// Without a server, every loaded tool with that name is returned.
    pub fn get_tool_info(
        &self,
        tool: &str,
        server: Option<&str>,
    ) -> Result<Vec<ToolManifestEntry>, ProxyError> {
        if let Some(server) = server {
            if !self.registry.is_loaded(server) {
                return Err(ProxyError::NotLoaded {
                    name: server.to_string(),
                });
            }
        }

        self.registry.with_index(|index| {
            let found: Vec<ToolManifestEntry> = match server {
                Some(server) => index.lookup(server, tool).cloned().into_iter().collect(),
                None => index.find_by_name(tool).into_iter().cloned().collect(),
            };
            if found.is_empty() {
                return Err(ProxyError::ToolNotFound {
                    server: server.unwrap_or("*").to_string(),
                    tool: tool.to_string(),
                    suggestions: index.suggest(server, tool, MAX_SUGGESTIONS),
                });
            }
            Ok(found)
        })
    }

    // ─── Installation ────────────────────────────────────────────────────

    fn installer(&self) -> Result<&Arc<dyn Installer>, ProxyError> {
        self.installer.as_ref().ok_or_else(|| ProxyError::InstallFailed {
            reason: "no installer configured".into(),
        })
    }

    pub async fn install(&self, request: &InstallRequest) -> Result<InstallOutcome, ProxyError> {
        self.installer()?.ensure_installed(request).await
    }

    /// Install a server, then load it, or reload it if it is already running.
    pub async fn install_and_load(
        &self,
        request: &InstallRequest,
    ) -> Result<(InstallOutcome, Activation), ProxyError> {
        let outcome = self.install(request).await?;
        let name = outcome.server_name.clone();

        let activation = if self.registry.is_loaded(&name) {
            Activation::Reloaded(self.reload(&name).await?)
        } else {
            Activation::Loaded(self.load(&name).await?)
        };
        Ok((outcome, activation))
    }

    pub async fn list_installed(&self) -> Result<Vec<InstalledServer>, ProxyError> {
        self.installer()?.list_installed().await
    }

    /// Remove an installed server, unloading it first if it is running.
    pub async fn uninstall(
        &self,
        name: &str,
        delete_files: bool,
    ) -> Result<UninstallOutcome, ProxyError> {
        let installer = self.installer()?;
        match self.registry.unload(name).await {
            Ok(_) | Err(ProxyError::NotLoaded { .. }) => {}
            Err(e) => return Err(e),
        }
        installer.uninstall(name, delete_files).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
