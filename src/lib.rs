pub mod commands;
pub mod proxy;
pub mod settings;

use std::path::{Path, PathBuf};

/// Env var that switches log output to JSON lines.
pub const LOG_FORMAT_ENV: &str = "MCP_PROXY_LOG_FORMAT";

/// Return the platform-standard data directory for the proxy.
///
/// - macOS: `~/Library/Application Support/mcp-proxy/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-proxy\`
/// - Linux: `$XDG_DATA_HOME/mcp-proxy/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-proxy/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-proxy");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-proxy")
}

/// Initialize the tracing subscriber.
///
/// Stdout carries the protocol, so logs go to `proxy.log` in the data
/// directory (rotated, last 3 kept) through a line-flushing writer. When
/// `to_stderr` is set, or the log file cannot be opened, logs go to stderr.
///
/// Returns the log file path when logging to a file.
pub fn init_tracing(to_stderr: bool) -> Option<PathBuf> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_proxy=info,warn"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let log_file = if to_stderr { None } else { open_log_file() };
    let log_path = log_file.as_ref().map(|(path, _)| path.clone());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    // `try_init` so embedding callers and tests that already set a
    // subscriber are left alone.
    let _ = match (log_file, json) {
        (Some((_, writer)), true) => builder.json().with_writer(writer).try_init(),
        (Some((_, writer)), false) => builder.with_writer(writer).try_init(),
        (None, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stderr".to_string()),
        pid = std::process::id(),
        "=== mcp-proxy starting ==="
    );
    log_path
}

fn open_log_file() -> Option<(PathBuf, FlushingWriter)> {
    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir).ok()?;

    let log_path = log_dir.join("proxy.log");

    // Rotate: proxy.log.2 → .3, .1 → .2, proxy.log → .1
    rotate_log_file(&log_path, 3);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok()?;
    Some((log_path, FlushingWriter::new(file)))
}

/// Rotate log files: `proxy.log` → `proxy.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps the last lines before a crash or a kill on disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
