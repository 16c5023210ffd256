//! Worker registry: the single source of truth for what is loaded.
//!
//! Mutations (load, reload, unload) are linearized per worker name with one
//! async `RwLock` per name: mutations hold it exclusively for their whole
//! duration, calls hold it shared only long enough to take a snapshot. The
//! entry map and the tool index live under one synchronous lock and are
//! always updated together, so readers see a worker's old state or its new
//! state, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::config::ConfigStore;
use super::errors::ProxyError;
use super::handle::{HandleTimeouts, WorkerHandle, WorkerState};
use super::index::ToolIndex;
use super::types::{LaunchSpec, ReloadStrategy, ServerInfo, ToolManifestEntry};

// ─── RegistryEntry ───────────────────────────────────────────────────────────

/// One loaded worker. Shared read-only as `Arc<RegistryEntry>`.
#[derive(Debug)]
pub struct RegistryEntry {
    name: String,
    /// Shared with the entry a tool refresh replaces this one with.
    handle: Arc<WorkerHandle>,
    manifest: Vec<ToolManifestEntry>,
    loaded_at: DateTime<Utc>,
    load_seq: u64,
    spec: LaunchSpec,
    manifest_digest: String,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn manifest(&self) -> &[ToolManifestEntry] {
        &self.manifest
    }

    pub fn tool(&self, name: &str) -> Option<&ToolManifestEntry> {
        self.manifest.iter().find(|t| t.name == name)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn load_seq(&self) -> u64 {
        self.load_seq
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.name.clone(),
            state: self.handle.state(),
            pid: self.handle.pid(),
            incarnation: self.handle.incarnation(),
            tools: self.manifest.iter().map(|t| t.name.clone()).collect(),
            tool_count: self.manifest.len(),
            loaded_at: self.loaded_at,
            load_seq: self.load_seq,
            manifest_digest: self.manifest_digest.clone(),
            server_info: self.handle.server_info().cloned(),
            exit_reason: self.handle.exit_reason(),
        }
    }
}

/// Status view of a loaded worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub incarnation: Uuid,
    pub tools: Vec<String>,
    pub tool_count: usize,
    pub loaded_at: DateTime<Utc>,
    pub load_seq: u64,
    pub manifest_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
}

/// Both sides of a successful reload or tool refresh.
#[derive(Debug)]
pub struct Reloaded {
    pub previous: Arc<RegistryEntry>,
    pub current: Arc<RegistryEntry>,
}

/// SHA-256 over the canonical JSON of a manifest.
pub fn manifest_digest(manifest: &[ToolManifestEntry]) -> String {
    let bytes = serde_json::to_vec(manifest).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

// ─── WorkerRegistry ──────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Arc<RegistryEntry>>,
    index: ToolIndex,
}

type NameLock = Arc<tokio::sync::RwLock<()>>;

pub struct WorkerRegistry {
    config: Arc<dyn ConfigStore>,
    timeouts: HandleTimeouts,
    state: RwLock<RegistryState>,
    locks: Mutex<HashMap<String, NameLock>>,
    next_seq: AtomicU64,
}

impl WorkerRegistry {
    pub fn new(config: Arc<dyn ConfigStore>, timeouts: HandleTimeouts) -> Self {
        Self {
            config,
            timeouts,
            state: RwLock::new(RegistryState::default()),
            locks: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    /// Spawn and register a worker.
    ///
    /// A dead entry under the same name is torn down and replaced.
    pub async fn load(&self, name: &str) -> Result<Arc<RegistryEntry>, ProxyError> {
        let lock = self.name_lock(name);
        let _guard = lock.write().await;

        if let Some(existing) = self.get(name) {
            if existing.handle().is_alive() {
                return Err(ProxyError::AlreadyLoaded {
                    name: name.to_string(),
                });
            }
            tracing::info!(server = name, "replacing dead worker entry");
            self.remove_entry(name);
            existing.handle().terminate().await;
        }

        let spec = self.config.resolve(name)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = self.spawn_entry(spec, seq).await?;
        self.install(Arc::clone(&entry));

        tracing::info!(
            server = name,
            tools = entry.manifest().len(),
            pid = ?entry.handle().pid(),
            "worker loaded"
        );
        Ok(entry)
    }

    /// Replace a worker's process under the same name.
    ///
    /// With the overlap strategy the old process serves until the new one is
    /// ready, and stays in place if the new one fails. With the restart
    /// strategy the old process stops first, and a failed start removes the
    /// entry.
    pub async fn reload(&self, name: &str) -> Result<Reloaded, ProxyError> {
        let lock = self.name_lock(name);
        let _guard = lock.write().await;

        let old = self.get(name).ok_or_else(|| ProxyError::NotLoaded {
            name: name.to_string(),
        })?;
        let old_alive = old.handle().is_alive();

        let spec = match self.config.resolve(name) {
            Ok(spec) => spec,
            Err(e) => return Err(self.reload_failed(&old, old_alive, e.to_string()).await),
        };

        if !old_alive || spec.reload_strategy == ReloadStrategy::Restart {
            old.handle().begin_reload();
            old.handle().terminate().await;
            return match self.spawn_entry(spec, old.load_seq()).await {
                Ok(current) => {
                    self.install(Arc::clone(&current));
                    tracing::info!(server = name, strategy = "restart", "worker reloaded");
                    Ok(Reloaded {
                        previous: old,
                        current,
                    })
                }
                Err(e) => Err(self.reload_failed(&old, false, e.to_string()).await),
            };
        }

        old.handle().begin_reload();
        match self.spawn_entry(spec, old.load_seq()).await {
            Ok(current) => {
                self.install(Arc::clone(&current));
                old.handle().terminate().await;
                tracing::info!(
                    server = name,
                    strategy = "overlap",
                    old_pid = ?old.handle().pid(),
                    new_pid = ?current.handle().pid(),
                    "worker reloaded"
                );
                Ok(Reloaded {
                    previous: old,
                    current,
                })
            }
            Err(e) => {
                old.handle().end_reload_failed();
                let kept = old.handle().is_alive();
                Err(self.reload_failed(&old, kept, e.to_string()).await)
            }
        }
    }

    /// Re-read a running worker's tool list without restarting it.
    ///
    /// The process, incarnation, and load order are kept; only the manifest
    /// and its index entries change.
    pub async fn refresh(&self, name: &str) -> Result<Reloaded, ProxyError> {
        let lock = self.name_lock(name);
        let _guard = lock.write().await;

        let old = self.get(name).ok_or_else(|| ProxyError::NotLoaded {
            name: name.to_string(),
        })?;
        let manifest = old.handle().list_tools(self.timeouts.handshake).await?;

        let current = Arc::new(RegistryEntry {
            name: old.name.clone(),
            handle: Arc::clone(&old.handle),
            manifest_digest: manifest_digest(&manifest),
            manifest,
            loaded_at: old.loaded_at,
            load_seq: old.load_seq,
            spec: old.spec.clone(),
        });
        self.install(Arc::clone(&current));

        tracing::info!(
            server = name,
            tools = current.manifest().len(),
            changed = current.manifest_digest() != old.manifest_digest(),
            "worker tools refreshed"
        );
        Ok(Reloaded {
            previous: old,
            current,
        })
    }

    async fn reload_failed(
        &self,
        old: &Arc<RegistryEntry>,
        keep: bool,
        reason: String,
    ) -> ProxyError {
        if !keep {
            self.remove_entry(old.name());
            old.handle().terminate().await;
        }
        tracing::warn!(
            server = %old.name(),
            previous_kept = keep,
            reason = %reason,
            "reload failed"
        );
        ProxyError::ReloadFailed {
            name: old.name().to_string(),
            reason,
            previous_kept: keep,
        }
    }

    /// Terminate a worker and remove it with its tools.
    pub async fn unload(&self, name: &str) -> Result<Arc<RegistryEntry>, ProxyError> {
        let lock = self.name_lock(name);
        let _guard = lock.write().await;

        let entry = self.remove_entry(name).ok_or_else(|| ProxyError::NotLoaded {
            name: name.to_string(),
        })?;
        entry.handle().terminate().await;
        tracing::info!(server = name, "worker unloaded");
        Ok(entry)
    }

    /// Current snapshot, without waiting for in-progress mutations.
    pub fn get(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.read_state().entries.get(name).cloned()
    }

    /// Snapshot for dispatching a call.
    ///
    /// Waits for an in-progress load, reload, or unload of this name first.
    pub async fn get_for_call(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        let lock = self.name_lock(name);
        let _guard = lock.read().await;
        self.get(name)
    }

    /// Loaded worker names in load order.
    pub fn list(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Loaded entries in load order.
    pub fn entries(&self) -> Vec<Arc<RegistryEntry>> {
        let mut entries: Vec<_> = self.read_state().entries.values().cloned().collect();
        entries.sort_by_key(|e| e.load_seq());
        entries
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.read_state().entries.contains_key(name)
    }

    /// Run `f` against the tool index under the registry's read lock.
    pub fn with_index<R>(&self, f: impl FnOnce(&ToolIndex) -> R) -> R {
        f(&self.read_state().index)
    }

    /// Terminate every worker concurrently and empty the registry.
    pub async fn shutdown_all(&self) {
        let entries: Vec<Arc<RegistryEntry>> = {
            let mut state = self.write_state();
            state.index = ToolIndex::new();
            state.entries.drain().map(|(_, e)| e).collect()
        };
        if entries.is_empty() {
            return;
        }

        tracing::info!(count = entries.len(), "shutting down all workers");
        futures::future::join_all(entries.iter().map(|e| e.handle().terminate())).await;
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn spawn_entry(
        &self,
        spec: LaunchSpec,
        load_seq: u64,
    ) -> Result<Arc<RegistryEntry>, ProxyError> {
        let spawned = WorkerHandle::spawn(&spec, &self.timeouts).await?;
        let manifest_digest = manifest_digest(&spawned.tools);
        Ok(Arc::new(RegistryEntry {
            name: spec.server_name.clone(),
            handle: Arc::new(spawned.handle),
            manifest: spawned.tools,
            loaded_at: Utc::now(),
            load_seq,
            spec,
            manifest_digest,
        }))
    }

    fn install(&self, entry: Arc<RegistryEntry>) {
        let mut state = self.write_state();
        state
            .index
            .upsert_worker(entry.name(), entry.load_seq(), entry.manifest());
        state.entries.insert(entry.name().to_string(), entry);
    }

    fn remove_entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        let mut state = self.write_state();
        state.index.remove_worker(name);
        state.entries.remove(name)
    }

    fn name_lock(&self, name: &str) -> NameLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
