//! Per-worker JSON-RPC request/response correlation.
//!
//! One [`RpcBridge`] exists per worker incarnation. A writer task owns the
//! worker's stdin, a single read loop runs over its stdout, and the bridge matches
//! responses to pending calls by id. Ids are allocated per bridge, so a
//! reloaded worker never sees ids from its predecessor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use super::errors::ProxyError;
use super::transport::{encode, FrameReader, FrameWriter, Framing};
use super::types::{
    error_codes, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CallOutcome = Result<Value, ProxyError>;

// ─── Pending Calls ───────────────────────────────────────────────────────────

struct PendingCall {
    method: String,
    deadline: Instant,
    /// `None` once the caller gave up; a late response is then discarded.
    waiter: Option<oneshot::Sender<CallOutcome>>,
}

#[derive(Default)]
struct BridgeState {
    pending: HashMap<u64, PendingCall>,
    closed: Option<String>,
}

impl BridgeState {
    fn active(&self) -> usize {
        self.pending.values().filter(|p| p.waiter.is_some()).count()
    }
}

/// Removes a call's pending entry if the call future is dropped early.
struct PendingGuard<'a> {
    bridge: &'a RpcBridge,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bridge.forget(self.id);
        }
    }
}

// ─── RpcBridge ───────────────────────────────────────────────────────────────

pub struct RpcBridge {
    server: String,
    incarnation: Uuid,
    framing: Framing,
    next_id: AtomicU64,
    state: Mutex<BridgeState>,
    /// Complete frames queued for the writer task. `None` once stdin is closed.
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    call_permit: Option<Semaphore>,
    idle: Notify,
    closed_tx: watch::Sender<Option<String>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcBridge {
    /// Bind a bridge to a worker's streams and start its read and write loops.
    pub fn start<R>(
        server: &str,
        incarnation: Uuid,
        reader: R,
        writer: BoxedWriter,
        framing: Framing,
        serialize_calls: bool,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(None);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            server: server.to_string(),
            incarnation,
            framing,
            next_id: AtomicU64::new(1),
            state: Mutex::new(BridgeState::default()),
            outbox: Mutex::new(Some(outbox_tx)),
            call_permit: serialize_calls.then(|| Semaphore::new(1)),
            idle: Notify::new(),
            closed_tx,
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        let writer_task = tokio::spawn(write_loop(
            Arc::downgrade(&bridge),
            FrameWriter::new(writer, framing),
            outbox_rx,
        ));
        *lock(&bridge.writer_task) = Some(writer_task);

        let reader_task = tokio::spawn(
            Arc::clone(&bridge).read_loop(FrameReader::new(reader, framing)),
        );
        *lock(&bridge.reader_task) = Some(reader_task);
        bridge
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout the call is abandoned locally; the worker is left running
    /// and a late response is discarded. The frame itself is handed to the
    /// writer task whole, so giving up never leaves a partial frame behind.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> CallOutcome {
        let deadline = Instant::now() + timeout;
        let timed_out = || ProxyError::Timeout {
            server: self.server.clone(),
            operation: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let _permit = match &self.call_permit {
            Some(sem) => Some(
                timeout_at(deadline, sem.acquire())
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|_| self.dead("bridge closed"))?,
            ),
            None => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.closed {
                return Err(self.dead(reason));
            }
            state.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    deadline,
                    waiter: Some(tx),
                },
            );
        }
        let guard = PendingGuard {
            bridge: self,
            id,
            armed: true,
        };

        let request = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        self.send(&request)?;

        match timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.dead("bridge dropped the call")),
            Err(_) => {
                self.abandon(id);
                guard.disarm();
                tracing::warn!(
                    server = %self.server,
                    method,
                    request_id = id,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out; worker left running"
                );
                Err(timed_out())
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        let note = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.send(&note)
    }

    /// Encode a message and queue it for the writer task.
    fn send(&self, message: &JsonRpcMessage) -> Result<(), ProxyError> {
        let frame = encode(message, self.framing).map_err(|e| ProxyError::Framing {
            server: self.server.clone(),
            reason: e.to_string(),
        })?;

        let outbox = lock(&self.outbox);
        let Some(tx) = outbox.as_ref() else {
            return Err(self.dead("stdin closed"));
        };
        tx.send(frame).map_err(|_| self.dead("stdin writer stopped"))
    }

    /// Wait until no non-abandoned call is in flight, up to `grace`.
    ///
    /// Returns `false` if calls were still running when the grace period ended.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&self.state).active() == 0 {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Close the worker's stdin once queued frames are written.
    /// Calls issued afterwards fail as `WorkerDead`.
    pub fn close_writer(&self) {
        lock(&self.outbox).take();
    }

    /// Stop both loops and fail every outstanding call.
    pub fn abort(&self, reason: &str) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.writer_task).take() {
            task.abort();
        }
        self.close(reason);
    }

    /// Resolves once the bridge is closed, yielding the close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "bridge dropped".to_string(),
        };
        reason
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.state).closed.clone()
    }

    /// Entries in the pending table, abandoned calls included.
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Calls whose caller is still waiting.
    pub fn active_calls(&self) -> usize {
        lock(&self.state).active()
    }

    // ─── Read Loop ───────────────────────────────────────────────────────

    async fn read_loop<R>(self: Arc<Self>, mut reader: FrameReader<R>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reason = loop {
            match reader.read_next().await {
                Ok(Some(JsonRpcMessage::Response(resp))) => self.dispatch(resp),
                Ok(Some(JsonRpcMessage::Request(req))) => self.answer(req),
                Ok(Some(JsonRpcMessage::Notification(note))) => {
                    tracing::debug!(
                        server = %self.server,
                        method = %note.method,
                        "notification from worker"
                    );
                }
                Ok(None) => break "stdout closed (process exited)".to_string(),
                Err(e) => {
                    tracing::warn!(server = %self.server, error = %e, "worker stream failed");
                    break format!("framing error: {e}");
                }
            }
        };
        self.close(&reason);
    }

    fn dispatch(&self, resp: JsonRpcResponse) {
        let Some(id) = resp.id.as_ref().and_then(|id| id.as_u64()) else {
            tracing::warn!(server = %self.server, id = ?resp.id, "response with unusable id");
            return;
        };

        let mut state = lock(&self.state);
        let Some(call) = state.pending.remove(&id) else {
            tracing::debug!(server = %self.server, request_id = id, "response for unknown id");
            return;
        };
        let idle = state.active() == 0;
        drop(state);

        match call.waiter {
            Some(waiter) => {
                let _ = waiter.send(extract_result(resp));
            }
            None => {
                let late_ms = Instant::now()
                    .saturating_duration_since(call.deadline)
                    .as_millis() as u64;
                tracing::debug!(
                    server = %self.server,
                    request_id = id,
                    method = %call.method,
                    late_ms,
                    "late response for abandoned call discarded"
                );
            }
        }

        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Answer a server-initiated request so the worker is never left waiting.
    fn answer(&self, req: JsonRpcRequest) {
        let response = match req.method.as_str() {
            "ping" => JsonRpcResponse::success(req.id, serde_json::json!({})),
            other => {
                tracing::debug!(server = %self.server, method = other, "unsupported worker request");
                JsonRpcResponse::failure(
                    Some(req.id),
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not supported by proxy: {other}"),
                )
            }
        };

        if let Err(e) = self.send(&JsonRpcMessage::Response(response)) {
            tracing::debug!(server = %self.server, error = %e, "failed to answer worker request");
        }
    }

    fn close(&self, reason: &str) {
        let drained: Vec<PendingCall> = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.to_string());
            state.pending.drain().map(|(_, call)| call).collect()
        };

        lock(&self.outbox).take();
        if let Some(sem) = &self.call_permit {
            sem.close();
        }
        for call in drained {
            if let Some(waiter) = call.waiter {
                let _ = waiter.send(Err(self.dead(reason)));
            }
        }
        self.idle.notify_waiters();
        self.closed_tx.send_replace(Some(reason.to_string()));
        tracing::debug!(server = %self.server, incarnation = %self.incarnation, reason, "bridge closed");
    }

    fn abandon(&self, id: u64) {
        let mut state = lock(&self.state);
        if let Some(call) = state.pending.get_mut(&id) {
            call.waiter = None;
        }
        let idle = state.active() == 0;
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn forget(&self, id: u64) {
        let mut state = lock(&self.state);
        if state.pending.remove(&id).is_none() {
            return;
        }
        let idle = state.active() == 0;
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn dead(&self, reason: &str) -> ProxyError {
        ProxyError::WorkerDead {
            name: self.server.clone(),
            reason: reason.to_string(),
        }
    }
}

// ─── Write Loop ──────────────────────────────────────────────────────────────

/// Sole owner of the worker's stdin. Frames are written whole and in order;
/// the loop shuts stdin down once every sender is gone.
async fn write_loop(
    bridge: Weak<RpcBridge>,
    mut writer: FrameWriter<BoxedWriter>,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            if let Some(bridge) = bridge.upgrade() {
                tracing::warn!(server = %bridge.server, error = %e, "write to worker stdin failed");
                bridge.close(&format!("failed to write to stdin: {e}"));
            }
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "stdin shutdown failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ProxyError`.
pub fn extract_result(response: JsonRpcResponse) -> CallOutcome {
    if let Some(err) = response.error {
        return Err(ProxyError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(ProxyError::Remote {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
