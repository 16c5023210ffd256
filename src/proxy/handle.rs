//! Worker process lifecycle.
//!
//! A [`WorkerHandle`] owns exactly one spawned process: its stdio, its
//! [`RpcBridge`], a stderr drain, and a supervisor task that reaps the process
//! and marks the handle `Terminated` when the stream dies. Every load and
//! every reload binds a fresh handle; handles are never restarted in place.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use super::bridge::RpcBridge;
use super::errors::ProxyError;
use super::types::{
    content_text, error_codes, InitializeResult, LaunchSpec, ListToolsResult, ServerInfo,
    ToolDefinition, ToolManifestEntry, CLIENT_NAME, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default deadline for spawn + initialize + tools/list.
///
/// 30s accommodates servers that import large ML frameworks at startup.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period before a terminating worker is force-killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on waiting for the OS to reap a killed process.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long to wait for stderr to flush after a failed handshake.
const STDERR_FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Window for the reader to drain stdout after the process exits.
const STDOUT_DRAIN_WAIT: Duration = Duration::from_secs(1);

const STDERR_TAIL_LINES: usize = 50;
const STDERR_TAIL_CHARS: usize = 2000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of one worker incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Reloading,
    Terminating,
    Terminated,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Reloading => "reloading",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Whether calls may still be dispatched to the process.
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Ready | Self::Reloading)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandleTimeouts {
    pub handshake: Duration,
    pub shutdown_grace: Duration,
}

impl Default for HandleTimeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

/// Last lines a worker wrote to stderr, kept for diagnostics.
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// The buffered lines joined, truncated from the front to a readable size.
    pub fn snapshot(&self) -> String {
        let joined = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        let chars = joined.chars().count();
        if chars <= STDERR_TAIL_CHARS {
            return joined;
        }
        let kept: String = joined.chars().skip(chars - STDERR_TAIL_CHARS).collect();
        format!("(truncated)...{kept}")
    }
}

type SharedTail = Arc<Mutex<StderrTail>>;

// ─── WorkerHandle ────────────────────────────────────────────────────────────

/// A spawned worker process bound to its protocol bridge.
pub struct WorkerHandle {
    name: String,
    pid: Option<u32>,
    incarnation: Uuid,
    spawned_at: DateTime<Utc>,
    state: Arc<watch::Sender<WorkerState>>,
    bridge: Arc<RpcBridge>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
    stderr: SharedTail,
    kill_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<Option<String>>,
    shutdown_grace: Duration,
}

/// A handle that completed its handshake, with the manifest it reported.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub handle: WorkerHandle,
    pub tools: Vec<ToolManifestEntry>,
}

impl WorkerHandle {
    /// Spawn the process, run the handshake, and fetch the tool manifest.
    ///
    /// On any failure the process is killed before returning.
    pub async fn spawn(
        spec: &LaunchSpec,
        timeouts: &HandleTimeouts,
    ) -> Result<SpawnedWorker, ProxyError> {
        let name = spec.server_name.as_str();
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args).envs(&spec.env);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProxyError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", spec.command),
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(ProxyError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(ProxyError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr: SharedTail = Arc::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain_stderr(name.to_string(), pipe, Arc::clone(&stderr))));

        let incarnation = Uuid::new_v4();
        let (state, _) = watch::channel(WorkerState::Spawning);
        let bridge = RpcBridge::start(
            name,
            incarnation,
            stdout,
            Box::new(stdin),
            spec.framing,
            spec.serialize_calls,
        );

        tracing::info!(
            server = name,
            pid = ?pid,
            incarnation = %incarnation,
            command = %spec.command,
            "worker spawned, starting handshake"
        );

        let outcome = timeout(timeouts.handshake, handshake(&bridge, timeouts.handshake)).await;
        let (init, definitions) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                return Err(abort_spawn(name, child, &bridge, stderr_task, &stderr, e.to_string()).await)
            }
            Err(_) => {
                let reason = format!(
                    "handshake timed out after {}ms",
                    timeouts.handshake.as_millis()
                );
                return Err(abort_spawn(name, child, &bridge, stderr_task, &stderr, reason).await);
            }
        };

        let tools = build_manifest(name, definitions);
        let state = Arc::new(state);
        state.send_replace(WorkerState::Ready);

        let (kill_tx, kill_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            name.to_string(),
            child,
            Arc::clone(&bridge),
            Arc::clone(&state),
            kill_rx,
            exit_tx,
            timeouts.shutdown_grace,
        ));

        let server_info = init.server_info;
        tracing::info!(
            server = name,
            pid = ?pid,
            tools = tools.len(),
            worker = ?server_info.as_ref().and_then(|i| i.name.clone()),
            "worker ready"
        );

        Ok(SpawnedWorker {
            handle: WorkerHandle {
                name: name.to_string(),
                pid,
                incarnation,
                spawned_at: Utc::now(),
                state,
                bridge,
                server_info,
                protocol_version: init.protocol_version,
                stderr,
                kill_tx,
                exit_rx,
                shutdown_grace: timeouts.shutdown_grace,
            },
            tools,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn bridge(&self) -> &Arc<RpcBridge> {
        &self.bridge
    }

    /// Current state. A closed bridge always reads as `Terminated`.
    pub fn state(&self) -> WorkerState {
        if self.bridge.is_closed() {
            return WorkerState::Terminated;
        }
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != WorkerState::Terminated
    }

    /// Why the worker stopped, if it has.
    pub fn exit_reason(&self) -> Option<String> {
        self.exit_rx
            .borrow()
            .clone()
            .or_else(|| self.bridge.close_reason())
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Mark the handle as being replaced. Returns `false` unless it was `Ready`.
    pub fn begin_reload(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == WorkerState::Ready {
                *s = WorkerState::Reloading;
                true
            } else {
                false
            }
        })
    }

    /// Return to `Ready` after a reload that kept this process.
    pub fn end_reload_failed(&self) {
        self.state.send_if_modified(|s| {
            if *s == WorkerState::Reloading {
                *s = WorkerState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Invoke a tool through the bridge.
    ///
    /// Results flagged `isError` are returned as `ProxyError::Remote`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        call_timeout: Duration,
    ) -> Result<Value, ProxyError> {
        let state = self.state();
        if !state.accepts_calls() {
            return Err(ProxyError::WorkerDead {
                name: self.name.clone(),
                reason: self
                    .exit_reason()
                    .unwrap_or_else(|| format!("worker is {state}")),
            });
        }

        let params = json!({
            "name": tool,
            "arguments": arguments,
        });

        let result = self
            .bridge
            .call("tools/call", Some(params), call_timeout)
            .await
            .map_err(|e| match e {
                ProxyError::Timeout {
                    server, timeout_ms, ..
                } => ProxyError::Timeout {
                    server,
                    operation: format!("tool '{tool}'"),
                    timeout_ms,
                },
                other => other,
            })?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = content_text(&result).unwrap_or_else(|| "tool reported an error".into());
            return Err(ProxyError::Remote {
                code: error_codes::TOOL_ERROR,
                message,
                data: Some(result),
            });
        }

        Ok(result)
    }

    /// Ask the running worker for its tools again and rebuild the manifest.
    pub async fn list_tools(&self, step_timeout: Duration) -> Result<Vec<ToolManifestEntry>, ProxyError> {
        let state = self.state();
        if !state.accepts_calls() {
            return Err(ProxyError::WorkerDead {
                name: self.name.clone(),
                reason: self
                    .exit_reason()
                    .unwrap_or_else(|| format!("worker is {state}")),
            });
        }
        let definitions = list_tools(&self.bridge, step_timeout).await?;
        Ok(build_manifest(&self.name, definitions))
    }

    /// Stop the worker: drain in-flight calls, close stdin, wait for exit,
    /// then kill. Bounded by roughly twice the grace period.
    pub async fn terminate(&self) {
        let mut exit_rx = self.exit_rx.clone();
        if exit_rx.borrow().is_some() {
            return;
        }

        self.state.send_if_modified(|s| {
            if *s == WorkerState::Terminated {
                false
            } else {
                *s = WorkerState::Terminating;
                true
            }
        });
        tracing::info!(server = %self.name, pid = ?self.pid, "terminating worker");

        if !self.bridge.wait_idle(self.shutdown_grace).await {
            tracing::warn!(
                server = %self.name,
                in_flight = self.bridge.active_calls(),
                "in-flight calls still running at shutdown"
            );
        }
        self.bridge.close_writer();

        if timeout(self.shutdown_grace, wait_exit(&mut exit_rx)).await.is_err() {
            tracing::warn!(
                server = %self.name,
                pid = ?self.pid,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "worker did not exit after stdin closed, killing"
            );
            self.kill_tx.send_replace(true);
            if timeout(KILL_WAIT, wait_exit(&mut exit_rx)).await.is_err() {
                tracing::error!(server = %self.name, pid = ?self.pid, "worker could not be reaped");
            }
        }

        self.bridge.abort("worker terminated");
        self.state.send_replace(WorkerState::Terminated);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // The supervisor kills the process once `kill_tx` is gone.
        self.bridge.abort("worker handle dropped");
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("incarnation", &self.incarnation)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

async fn handshake(
    bridge: &RpcBridge,
    step_timeout: Duration,
) -> Result<(InitializeResult, Vec<ToolDefinition>), ProxyError> {
    let name = bridge.server();
    let bad_payload = |what: &str, e: serde_json::Error| ProxyError::HandshakeFailed {
        name: name.to_string(),
        reason: format!("failed to parse {what} response: {e}"),
    };

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let raw = bridge.call("initialize", Some(params), step_timeout).await?;
    let init: InitializeResult =
        serde_json::from_value(raw).map_err(|e| bad_payload("initialize", e))?;

    bridge.notify("notifications/initialized", None)?;

    let tools = list_tools(bridge, step_timeout).await?;
    Ok((init, tools))
}

/// Fetch every page of `tools/list`. A worker without the method has no tools.
async fn list_tools(
    bridge: &RpcBridge,
    step_timeout: Duration,
) -> Result<Vec<ToolDefinition>, ProxyError> {
    let name = bridge.server();
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let raw = match bridge.call("tools/list", params, step_timeout).await {
            Ok(raw) => raw,
            Err(ProxyError::Remote { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                tracing::info!(server = name, "worker does not list tools; empty manifest");
                break;
            }
            Err(e) => return Err(e),
        };
        let page: ListToolsResult =
            serde_json::from_value(raw).map_err(|e| ProxyError::Remote {
                code: error_codes::INTERNAL_ERROR,
                message: format!("failed to parse tools/list response: {e}"),
                data: None,
            })?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => break,
        }
    }
    Ok(tools)
}

fn build_manifest(server: &str, definitions: Vec<ToolDefinition>) -> Vec<ToolManifestEntry> {
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(definitions.len());
    for def in definitions {
        if !seen.insert(def.name.clone()) {
            tracing::warn!(server, tool = %def.name, "duplicate tool name in manifest, keeping first");
            continue;
        }
        tools.push(ToolManifestEntry::from_definition(server, def));
    }
    tools
}

/// Tear down a worker whose handshake failed and build the error to report.
async fn abort_spawn(
    name: &str,
    mut child: Child,
    bridge: &RpcBridge,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    stderr: &SharedTail,
    reason: String,
) -> ProxyError {
    bridge.abort("handshake failed");
    let _ = child.start_kill();
    let _ = timeout(KILL_WAIT, child.wait()).await;
    if let Some(task) = stderr_task {
        let _ = timeout(STDERR_FLUSH_WAIT, task).await;
    }

    let stderr_ctx = stderr
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot();
    if !stderr_ctx.is_empty() {
        tracing::warn!(
            server = name,
            stderr = %stderr_ctx,
            "server stderr captured on failure"
        );
    }

    ProxyError::HandshakeFailed {
        name: name.to_string(),
        reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn drain_stderr(name: String, pipe: ChildStderr, tail: SharedTail) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(server = %name, line = %line, "worker stderr");
                tail.lock().unwrap_or_else(PoisonError::into_inner).push(line);
            }
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Owns the child process after the handshake: reaps it, and marks the
/// handle `Terminated` when either the process or its stdout stream ends.
async fn supervise(
    name: String,
    mut child: Child,
    bridge: Arc<RpcBridge>,
    state: Arc<watch::Sender<WorkerState>>,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<String>>,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = bridge.closed() => None,
        _ = kill_rx.changed() => Some(kill_and_reap(&mut child).await),
    };

    let stopping =
        *state.borrow() == WorkerState::Terminating || kill_rx.has_changed().is_err();

    let status = match exited {
        Some(status) => {
            // Let the reader drain whatever the process wrote before exiting.
            if timeout(STDOUT_DRAIN_WAIT, bridge.closed()).await.is_err() {
                bridge.abort("process exited");
            }
            status
        }
        None => {
            state.send_replace(WorkerState::Terminated);
            tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep(grace) => kill_and_reap(&mut child).await,
                _ = kill_rx.changed() => kill_and_reap(&mut child).await,
            }
        }
    };

    state.send_replace(WorkerState::Terminated);
    let description = describe_exit(&status);
    if stopping {
        tracing::info!(server = %name, exit = %description, "worker stopped");
    } else {
        tracing::warn!(
            server = %name,
            exit = %description,
            reason = ?bridge.close_reason(),
            "worker exited unexpectedly"
        );
    }
    exit_tx.send_replace(Some(description));
}

async fn kill_and_reap(child: &mut Child) -> std::io::Result<ExitStatus> {
    let _ = child.start_kill();
    child.wait().await
}

async fn wait_exit(rx: &mut watch::Receiver<Option<String>>) {
    let _ = rx.wait_for(Option::is_some).await.map(|_| ());
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exited with code {code}"),
            None => format!("terminated by signal ({status})"),
        },
        Err(e) => format!("wait failed: {e}"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
