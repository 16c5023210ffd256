//! End-to-end tests driving real `example-worker` processes through the proxy core.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use mcp_proxy::proxy::types::error_codes;
use mcp_proxy::proxy::{
    CoreOptions, HandleTimeouts, LaunchSpec, MemoryConfigStore, ProxyCore, ProxyError,
    ReloadStrategy, WorkerState,
};

const WORKER: &str = env!("CARGO_BIN_EXE_example-worker");

fn spec(name: &str) -> LaunchSpec {
    LaunchSpec::new(name, WORKER).with_env("RUST_LOG", "info")
}

fn options() -> CoreOptions {
    CoreOptions {
        timeouts: HandleTimeouts {
            handshake: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        },
        call_timeout: Duration::from_secs(10),
        auto_load_on_call: false,
    }
}

fn setup(names: &[&str]) -> (Arc<MemoryConfigStore>, ProxyCore) {
    let store = Arc::new(MemoryConfigStore::new());
    for name in names {
        store.insert(spec(name));
    }
    let core = ProxyCore::new(store.clone(), options());
    (store, core)
}

fn pid_of(core: &ProxyCore, name: &str) -> Option<u32> {
    core.registry().get(name).and_then(|e| e.handle().pid())
}

async fn wait_for_state(core: &ProxyCore, name: &str, want: WorkerState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = core.registry().get(name).map(|e| e.handle().state());
        if state == Some(want) {
            return;
        }
        assert!(Instant::now() < deadline, "{name} never reached {want}, last {state:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// ─── Load / Call ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_list_and_call() {
    let (_store, core) = setup(&["example"]);

    let report = core.load("example").await.unwrap();
    assert_eq!(report.server, "example");
    assert!(report.pid.is_some());
    assert!(report.tools.iter().any(|t| t.name == "add_numbers"));
    assert_eq!(core.list(), vec!["example".to_string()]);

    let status = core.loaded_servers();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, WorkerState::Ready);
    assert_eq!(status[0].manifest_digest, report.manifest_digest);

    let sum = core
        .call("example", "add_numbers", json!({ "a": 2, "b": 3 }))
        .await
        .unwrap();
    assert_eq!(sum.simplified()["result"], 5);

    let greeting = core
        .call("example", "hello_world", json!({ "name": "Proxy" }))
        .await
        .unwrap();
    assert_eq!(greeting.simplified()["message"], "Hello, Proxy!");

    // Null arguments are sent as an empty object.
    let default_greeting = core
        .call("example", "hello_world", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(default_greeting.simplified()["message"], "Hello, World!");

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_twice_is_already_loaded() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();
    let pid = pid_of(&core, "example");

    let err = core.load("example").await.unwrap_err();
    assert!(matches!(err, ProxyError::AlreadyLoaded { .. }));
    assert_eq!(pid_of(&core, "example"), pid);

    core.shutdown().await;
}

#[tokio::test]
async fn load_unknown_server() {
    let (_store, core) = setup(&[]);
    let err = core.load("nope").await.unwrap_err();
    assert!(matches!(err, ProxyError::ConfigNotFound { .. }));
    assert!(core.list().is_empty());
}

#[tokio::test]
async fn load_missing_command() {
    let (store, core) = setup(&[]);
    store.insert(LaunchSpec::new("broken", "/definitely/not/a/real/binary"));

    let err = core.load("broken").await.unwrap_err();
    assert!(matches!(err, ProxyError::SpawnFailed { .. }));
    assert!(err.is_infrastructure());
    assert!(!core.registry().is_loaded("broken"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_timeout_rolls_back() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(spec("silent").with_env("EXAMPLE_WORKER_SILENT_HANDSHAKE", "1"));
    let mut opts = options();
    opts.timeouts.handshake = Duration::from_millis(300);
    let core = ProxyCore::new(store.clone(), opts);

    let err = core.load("silent").await.unwrap_err();
    assert!(matches!(err, ProxyError::HandshakeFailed { .. }), "{err:?}");
    assert!(!core.registry().is_loaded("silent"));
    assert!(core.search("hello", 10).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_load_on_first_call() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(spec("lazy"));
    let mut opts = options();
    opts.auto_load_on_call = true;
    let core = ProxyCore::new(store.clone(), opts);

    let result = core
        .call("lazy", "add_numbers", json!({ "a": 1, "b": 1 }))
        .await
        .unwrap();
    assert_eq!(result.simplified()["result"], 2);
    assert!(core.registry().is_loaded("lazy"));

    core.shutdown().await;
}

// ─── Call Errors ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn call_errors_are_classified() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();

    let err = core
        .call("example", "add_number", json!({ "a": 1, "b": 2 }))
        .await
        .unwrap_err();
    match &err {
        ProxyError::ToolNotFound { suggestions, .. } => {
            assert!(suggestions.contains(&"add_numbers".to_string()));
        }
        other => panic!("expected ToolNotFound, got {other:?}"),
    }
    assert!(!err.is_infrastructure());

    let err = core
        .call("example", "add_numbers", json!({ "a": 1 }))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidArguments { .. }));

    let err = core.call("example", "fail", json!({})).await.unwrap_err();
    match &err {
        ProxyError::Remote { code, message, .. } => {
            assert_eq!(*code, error_codes::TOOL_ERROR);
            assert!(message.contains("intentional failure"));
        }
        other => panic!("expected Remote, got {other:?}"),
    }
    assert!(!err.is_infrastructure());

    // The worker is unaffected by any of the above.
    assert!(core.call("example", "hello_world", json!({})).await.is_ok());

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_overlap() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();

    let start = Instant::now();
    let calls = (0..4).map(|i| {
        core.call(
            "example",
            "slow_echo",
            json!({ "text": format!("call {i}"), "delay_ms": 500 }),
        )
    });
    let results = futures::future::join_all(calls).await;
    let elapsed = start.elapsed();

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().simplified()["text"], format!("call {i}"));
    }
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_leaves_worker_running() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(spec("example"));
    let mut opts = options();
    opts.call_timeout = Duration::from_millis(300);
    let core = ProxyCore::new(store.clone(), opts);
    core.load("example").await.unwrap();
    let pid = pid_of(&core, "example");

    let err = core
        .call("example", "slow_echo", json!({ "text": "late", "delay_ms": 1000 }))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));

    let ok = core.call("example", "hello_world", json!({})).await.unwrap();
    assert_eq!(ok.simplified()["message"], "Hello, World!");
    assert_eq!(pid_of(&core, "example"), pid);

    // The late response arrives and is dropped without disturbing later calls.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(core.call("example", "hello_world", json!({})).await.is_ok());

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_reports_dead() {
    let (_store, core) = setup(&["example", "other"]);
    core.load("example").await.unwrap();
    core.load("other").await.unwrap();

    let err = core.call("example", "crash", json!({})).await.unwrap_err();
    assert!(matches!(err, ProxyError::WorkerDead { .. }), "{err:?}");
    assert!(err.is_infrastructure());

    wait_for_state(&core, "example", WorkerState::Terminated).await;
    let err = core.call("example", "hello_world", json!({})).await.unwrap_err();
    assert!(matches!(err, ProxyError::WorkerDead { .. }));
    assert!(core.registry().is_loaded("example"));

    // Other workers are unaffected.
    assert!(core.call("other", "hello_world", json!({})).await.is_ok());

    // Loading over the dead entry replaces it.
    core.load("example").await.unwrap();
    assert!(core.call("example", "hello_world", json!({})).await.is_ok());

    core.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn externally_killed_worker_reports_dead() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();
    let pid = pid_of(&core, "example").unwrap();

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    wait_for_state(&core, "example", WorkerState::Terminated).await;
    let err = core.call("example", "hello_world", json!({})).await.unwrap_err();
    assert!(matches!(err, ProxyError::WorkerDead { .. }));

    let statuses = core.loaded_servers();
    assert_eq!(statuses[0].state, WorkerState::Terminated);

    // A reload of a dead entry starts a fresh process.
    let report = core.reload("example").await.unwrap();
    assert_ne!(report.pid, Some(pid));
    assert!(core.call("example", "hello_world", json!({})).await.is_ok());

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_to_different_workers_run_in_parallel() {
    let (_store, core) = setup(&["alpha", "beta"]);
    core.load("alpha").await.unwrap();
    core.load("beta").await.unwrap();

    let start = Instant::now();
    let (a, b) = tokio::join!(
        core.call("alpha", "slow_echo", json!({ "text": "a", "delay_ms": 600 })),
        core.call("beta", "slow_echo", json!({ "text": "b", "delay_ms": 600 })),
    );
    let elapsed = start.elapsed();

    assert_eq!(a.unwrap().simplified()["text"], "a");
    assert_eq!(b.unwrap().simplified()["text"], "b");
    assert!(elapsed < Duration::from_millis(1100), "took {elapsed:?}");

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handshake_does_not_block_loaded_worker() {
    let (store, core) = setup(&["example"]);
    core.load("example").await.unwrap();
    store.insert(spec("sluggish").with_env("EXAMPLE_WORKER_HANDSHAKE_DELAY_MS", "1500"));

    let (loaded, (called, call_time)) = tokio::join!(core.load("sluggish"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let start = Instant::now();
        let result = core.call("example", "hello_world", json!({})).await;
        (result, start.elapsed())
    });

    assert!(called.is_ok());
    assert!(call_time < Duration::from_millis(1000), "call waited {call_time:?}");
    assert_eq!(loaded.unwrap().server, "sluggish");

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_call_does_not_disturb_concurrent_call() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(spec("example"));
    let mut opts = options();
    opts.call_timeout = Duration::from_millis(300);
    let core = ProxyCore::new(store.clone(), opts);
    core.load("example").await.unwrap();

    // Larger than a pipe buffer, so the request is still being written
    // when the other call is queued behind it.
    let bulky = "x".repeat(256 * 1024);
    let (slow, quick) = tokio::join!(
        core.call("example", "slow_echo", json!({ "text": bulky, "delay_ms": 1000 })),
        core.call("example", "slow_echo", json!({ "text": "quick", "delay_ms": 50 })),
    );

    assert!(matches!(slow, Err(ProxyError::Timeout { .. })), "{slow:?}");
    assert_eq!(quick.unwrap().simplified()["text"], "quick");

    let after = core.call("example", "add_numbers", json!({ "a": 1, "b": 1 })).await.unwrap();
    assert_eq!(after.simplified()["result"], 2);

    core.shutdown().await;
}

// ─── Reload ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_replaces_process_and_tracks_tools() {
    let (store, core) = setup(&["example"]);
    core.load("example").await.unwrap();
    let old_pid = pid_of(&core, "example");

    let report = core.reload("example").await.unwrap();
    assert_eq!(report.previous_pid, old_pid);
    assert_ne!(report.pid, old_pid);
    assert!(!report.tools_changed);

    store.insert(spec("example").with_env("EXAMPLE_WORKER_EXTRA_TOOLS", "1"));
    let report = core.reload("example").await.unwrap();
    assert!(report.tools_changed);
    assert_eq!(report.added, vec!["extra_tool".to_string()]);
    assert!(report.removed.is_empty());
    assert!(core.lookup("example", "extra_tool").is_some());

    let info = core.call("example", "process_info", json!({})).await.unwrap();
    assert_eq!(info.simplified()["pid"], json!(report.pid));

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_overlap_reload_keeps_old_worker() {
    let (store, core) = setup(&["example"]);
    core.load("example").await.unwrap();
    let old_pid = pid_of(&core, "example");

    store.insert(spec("example").with_env("EXAMPLE_WORKER_FAIL_START", "1"));
    let err = core.reload("example").await.unwrap_err();
    match err {
        ProxyError::ReloadFailed { previous_kept, .. } => assert!(previous_kept),
        other => panic!("expected ReloadFailed, got {other:?}"),
    }

    assert_eq!(pid_of(&core, "example"), old_pid);
    assert_eq!(core.loaded_servers()[0].state, WorkerState::Ready);
    assert!(core.call("example", "hello_world", json!({})).await.is_ok());

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_restart_reload_removes_entry() {
    let (store, core) = setup(&["example"]);
    core.load("example").await.unwrap();

    store.insert(
        spec("example")
            .with_env("EXAMPLE_WORKER_FAIL_START", "1")
            .with_reload_strategy(ReloadStrategy::Restart),
    );
    let err = core.reload("example").await.unwrap_err();
    match err {
        ProxyError::ReloadFailed { previous_kept, .. } => assert!(!previous_kept),
        other => panic!("expected ReloadFailed, got {other:?}"),
    }
    assert!(!core.registry().is_loaded("example"));
    assert!(core.lookup("example", "hello_world").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn call_during_reload_is_served() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();

    let (reloaded, called) = tokio::join!(
        core.reload("example"),
        core.call("example", "add_numbers", json!({ "a": 20, "b": 22 })),
    );
    assert!(reloaded.is_ok());
    assert_eq!(called.unwrap().simplified()["result"], 42);

    core.shutdown().await;
}

#[tokio::test]
async fn reload_unloaded_is_not_loaded() {
    let (_store, core) = setup(&["example"]);
    assert!(matches!(
        core.reload("example").await,
        Err(ProxyError::NotLoaded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_picks_up_tool_changes_without_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("extra-tools");
    let (store, core) = setup(&[]);
    store.insert(spec("example").with_env("EXAMPLE_WORKER_EXTRA_TOOLS_FILE", marker.to_str().unwrap()));

    let loaded = core.load("example").await.unwrap();
    assert_eq!(loaded.tool_count, 7);
    let pid = loaded.pid;

    let unchanged = core.refresh_tools("example").await.unwrap();
    assert!(!unchanged.tools_changed);
    assert_eq!(unchanged.pid, pid);

    std::fs::write(&marker, "").unwrap();
    let report = core.refresh_tools("example").await.unwrap();
    assert!(report.tools_changed);
    assert_eq!(report.added, vec!["extra_tool".to_string()]);
    assert_eq!(report.previous_pid, pid);
    assert_eq!(report.pid, pid);
    assert_eq!(core.loaded_servers()[0].tool_count, 8);
    assert_eq!(core.search("extra", 10)[0].tool.name, "extra_tool");
    let extra = core.call("example", "extra_tool", json!({})).await.unwrap();
    assert_eq!(extra.simplified()["extra"], true);

    std::fs::remove_file(&marker).unwrap();
    let report = core.refresh_tools("example").await.unwrap();
    assert_eq!(report.removed, vec!["extra_tool".to_string()]);
    assert!(core.lookup("example", "extra_tool").is_none());
    assert!(matches!(
        core.call("example", "extra_tool", json!({})).await,
        Err(ProxyError::ToolNotFound { .. })
    ));
    assert_eq!(pid_of(&core, "example"), pid);

    let _ = core.call("example", "crash", json!({})).await;
    wait_for_state(&core, "example", WorkerState::Terminated).await;
    assert!(matches!(
        core.refresh_tools("example").await,
        Err(ProxyError::WorkerDead { .. })
    ));
}

// ─── Unload / Discovery / Shutdown ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unload_removes_tools() {
    let (_store, core) = setup(&["example"]);
    core.load("example").await.unwrap();

    let hits = core.search("add", 10);
    assert_eq!(hits[0].tool.name, "add_numbers");
    assert!(core.lookup("example", "add_numbers").is_some());

    let report = core.unload("example").await.unwrap();
    assert_eq!(report.server, "example");

    assert!(core.search("add", 10).is_empty());
    assert!(core.lookup("example", "add_numbers").is_none());
    assert!(core.list_all_tools().is_empty());
    assert!(matches!(
        core.call("example", "add_numbers", json!({ "a": 1, "b": 2 })).await,
        Err(ProxyError::NotLoaded { .. })
    ));
    assert!(matches!(
        core.unload("example").await,
        Err(ProxyError::NotLoaded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_info_across_workers() {
    let (_store, core) = setup(&["alpha", "beta"]);
    core.load("alpha").await.unwrap();
    core.load("beta").await.unwrap();

    let all = core.get_tool_info("hello_world", None).unwrap();
    let servers: Vec<&str> = all.iter().map(|t| t.server.as_str()).collect();
    assert_eq!(servers, vec!["alpha", "beta"]);

    let one = core.get_tool_info("hello_world", Some("beta")).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].input_schema["type"], "object");

    assert_eq!(core.list_all_tools().len(), 2 * 7);

    let available = core.available_servers().unwrap();
    assert!(available.iter().all(|s| s.loaded));

    core.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_terminates_every_worker() {
    let (_store, core) = setup(&["alpha", "beta"]);
    core.load("alpha").await.unwrap();
    core.load("beta").await.unwrap();
    let alpha = core.registry().get("alpha").unwrap();
    let beta = core.registry().get("beta").unwrap();

    core.shutdown().await;

    assert!(core.list().is_empty());
    assert_eq!(alpha.handle().state(), WorkerState::Terminated);
    assert_eq!(beta.handle().state(), WorkerState::Terminated);

    #[cfg(unix)]
    for pid in [alpha.handle().pid(), beta.handle().pid()].into_iter().flatten() {
        assert!(!process_exists(pid), "worker {pid} still running");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unload_then_load_rebuilds_manifest() {
    let (store, core) = setup(&[]);
    store.insert(spec("example").with_env("EXAMPLE_WORKER_EXTRA_TOOLS", "1"));
    let first = core.load("example").await.unwrap();
    assert_eq!(first.tool_count, 8);
    assert!(core.lookup("example", "extra_tool").is_some());

    core.unload("example").await.unwrap();
    store.insert(spec("example"));
    let second = core.load("example").await.unwrap();

    assert_eq!(second.tool_count, 7);
    assert_ne!(second.pid, first.pid);
    assert_ne!(second.manifest_digest, first.manifest_digest);
    assert!(core.lookup("example", "extra_tool").is_none());
    assert!(core.search("extra", 10).is_empty());
    assert_eq!(core.list_all_tools().len(), 7);

    core.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_ignoring_eof_is_killed_after_grace() {
    let store = Arc::new(MemoryConfigStore::new());
    store.insert(spec("stubborn").with_env("EXAMPLE_WORKER_IGNORE_EOF", "1"));
    let grace = Duration::from_millis(300);
    let mut opts = options();
    opts.timeouts.shutdown_grace = grace;
    let core = ProxyCore::new(store.clone(), opts);

    let pid = core.load("stubborn").await.unwrap().pid.unwrap();
    let start = Instant::now();
    core.unload("stubborn").await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= grace, "returned before the grace period: {elapsed:?}");
    assert!(elapsed < grace * 2 + Duration::from_secs(1), "took {elapsed:?}");
    assert!(!process_exists(pid), "worker {pid} still running");
}
