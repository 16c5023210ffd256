//! Server installer: fetch worker packages from git and register them.
//!
//! Installation clones (or pulls) a repository into the install directory,
//! installs its Python requirements, detects the entry file, and writes a
//! `.mcp.json` entry so the server can be loaded by name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::config::{ConfigStore, McpJsonConfig, ServerConfig};
use super::errors::ProxyError;

/// Entry files tried in order before pattern-based detection.
const SERVER_FILE_CANDIDATES: [&str; 3] = ["server.py", "main.py", "app.py"];

const DEFAULT_REQUIREMENTS: &str = "requirements.txt";

// ─── Requests & Results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Repository URL, optionally suffixed with `@branch` or `@tag`.
    pub git_url: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_file: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub requirements_file: Option<String>,
    #[serde(default = "default_true")]
    pub auto_detect: bool,
}

fn default_true() -> bool {
    true
}

impl InstallRequest {
    pub fn new(git_url: &str) -> Self {
        Self {
            git_url: git_url.to_string(),
            auto_detect: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub server_name: String,
    pub install_path: PathBuf,
    pub server_file: String,
    /// The repository already existed and was pulled rather than cloned.
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledServer {
    pub name: String,
    pub path: String,
    pub command: String,
    pub env_vars: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallOutcome {
    pub name: String,
    pub deleted_path: Option<PathBuf>,
}

// ─── Installer ───────────────────────────────────────────────────────────────

/// Source of installable worker packages.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Fetch a server and register it in the configuration.
    async fn ensure_installed(&self, request: &InstallRequest) -> Result<InstallOutcome, ProxyError>;

    async fn list_installed(&self) -> Result<Vec<InstalledServer>, ProxyError>;

    /// Remove a server from the configuration, optionally deleting its files.
    async fn uninstall(&self, name: &str, delete_files: bool) -> Result<UninstallOutcome, ProxyError>;
}

/// Installs Python MCP servers from git repositories.
#[derive(Debug, Clone)]
pub struct GitInstaller {
    install_dir: PathBuf,
    config: McpJsonConfig,
    python: String,
}

impl GitInstaller {
    pub fn new(install_dir: impl Into<PathBuf>, config: McpJsonConfig) -> Self {
        Self {
            install_dir: install_dir.into(),
            config,
            python: find_python(),
        }
    }

    /// Override the interpreter used for `pip` and for launching servers.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    async fn fetch(&self, url: &str, git_ref: Option<&str>, path: &Path) -> Result<bool, ProxyError> {
        if path.exists() {
            self.update(path, git_ref).await?;
            return Ok(true);
        }

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url).arg(path);
        if let Some(git_ref) = git_ref {
            cmd.arg("--branch").arg(git_ref);
        }
        run(&mut cmd, "clone repository").await?;
        tracing::info!(url, path = %path.display(), "repository cloned");
        Ok(false)
    }

    /// Bring an existing checkout up to date, switching to `git_ref` first
    /// when one is given. A detached checkout (tag or commit) is not pulled.
    async fn update(&self, path: &Path, git_ref: Option<&str>) -> Result<(), ProxyError> {
        let git = || {
            let mut cmd = Command::new("git");
            cmd.arg("-C").arg(path);
            cmd
        };

        if let Some(git_ref) = git_ref {
            tracing::info!(path = %path.display(), git_ref, "repository exists, fetching ref");
            run(git().args(["fetch", "--tags", "origin"]), "fetch repository").await?;
            run(git().arg("checkout").arg(git_ref), "check out ref").await?;
        } else {
            tracing::info!(path = %path.display(), "repository exists, pulling");
        }

        if run(git().args(["symbolic-ref", "-q", "HEAD"]), "inspect HEAD").await.is_err() {
            tracing::info!(path = %path.display(), "detached checkout, skipping pull");
            return Ok(());
        }
        run(git().arg("pull"), "update repository").await
    }

    async fn install_requirements(
        &self,
        repo: &Path,
        requirements_file: Option<&str>,
    ) -> Result<(), ProxyError> {
        let file = requirements_file.unwrap_or(DEFAULT_REQUIREMENTS);
        let path = repo.join(file);
        if !path.exists() {
            tracing::info!(file, "no requirements file, skipping dependency installation");
            return Ok(());
        }

        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "pip", "install", "-r"]).arg(&path);
        run(&mut cmd, "install dependencies").await?;
        tracing::info!(file, "dependencies installed");
        Ok(())
    }
}

#[async_trait]
impl Installer for GitInstaller {
    async fn ensure_installed(&self, request: &InstallRequest) -> Result<InstallOutcome, ProxyError> {
        let (repo_name, git_ref) = parse_git_url(&request.git_url)?;
        let server_name = request.server_name.clone().unwrap_or_else(|| repo_name.clone());
        validate_name(&server_name)?;

        std::fs::create_dir_all(&self.install_dir).map_err(|e| ProxyError::InstallFailed {
            reason: format!("cannot create {}: {e}", self.install_dir.display()),
        })?;

        let install_path = self.install_dir.join(&repo_name);
        let url = strip_ref(&request.git_url, git_ref.as_deref());
        let updated = self.fetch(url, git_ref.as_deref(), &install_path).await?;
        self.install_requirements(&install_path, request.requirements_file.as_deref())
            .await?;

        let server_file = match (&request.server_file, request.auto_detect) {
            (Some(file), _) => file.clone(),
            (None, true) => detect_server_file(&install_path).ok_or_else(|| {
                ProxyError::InstallFailed {
                    reason: "could not auto-detect server file; specify server_file".into(),
                }
            })?,
            (None, false) => {
                return Err(ProxyError::InstallFailed {
                    reason: "no server file specified and auto-detect is disabled".into(),
                })
            }
        };

        let server_path = install_path.join(&server_file);
        if !server_path.is_file() {
            return Err(ProxyError::InstallFailed {
                reason: format!("server file not found: {}", server_path.display()),
            });
        }
        let server_path = server_path.canonicalize().unwrap_or(server_path);

        self.config.upsert_server(
            &server_name,
            ServerConfig {
                command: self.python.clone(),
                args: vec![server_path.to_string_lossy().into_owned()],
                env: request.env.clone(),
                ..Default::default()
            },
        )?;
        // The entry must resolve before a load is attempted against it.
        self.config.resolve(&server_name)?;

        tracing::info!(
            server = %server_name,
            path = %install_path.display(),
            server_file = %server_file,
            updated,
            "server installed"
        );

        Ok(InstallOutcome {
            server_name,
            install_path,
            server_file,
            updated,
        })
    }

    async fn list_installed(&self) -> Result<Vec<InstalledServer>, ProxyError> {
        let doc = self.config.read()?;
        Ok(doc
            .servers
            .into_iter()
            .map(|(name, server)| {
                let mut env_vars: Vec<String> = server.env.into_keys().collect();
                env_vars.sort();
                InstalledServer {
                    name,
                    path: server
                        .args
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string()),
                    command: server.command,
                    env_vars,
                }
            })
            .collect())
    }

    async fn uninstall(&self, name: &str, delete_files: bool) -> Result<UninstallOutcome, ProxyError> {
        let removed = self
            .config
            .remove_server(name)?
            .ok_or_else(|| ProxyError::ConfigNotFound {
                name: name.to_string(),
            })?;

        let mut deleted_path = None;
        if delete_files {
            if let Some(repo) = removed
                .args
                .first()
                .and_then(|arg| repo_root(&self.install_dir, Path::new(arg)))
            {
                std::fs::remove_dir_all(&repo).map_err(|e| ProxyError::InstallFailed {
                    reason: format!("failed to delete {}: {e}", repo.display()),
                })?;
                tracing::info!(server = name, path = %repo.display(), "server files deleted");
                deleted_path = Some(repo);
            }
        }

        Ok(UninstallOutcome {
            name: name.to_string(),
            deleted_path,
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn run(cmd: &mut Command, what: &str) -> Result<(), ProxyError> {
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| ProxyError::InstallFailed {
            reason: format!("failed to {what}: {e}"),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(ProxyError::InstallFailed {
        reason: format!(
            "failed to {what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

/// Split a git URL into its repository name and optional `@ref` suffix.
///
/// `git@host:org/repo.git` keeps its user part; a ref is only recognized
/// after the path separator.
pub fn parse_git_url(url: &str) -> Result<(String, Option<String>), ProxyError> {
    let url = url.trim();
    let path_start = if url.starts_with("git@") {
        url.find(':').map(|i| i + 1).unwrap_or(url.len())
    } else {
        0
    };

    let (base, git_ref) = match url[path_start..].rsplit_once('@') {
        Some((base, git_ref)) if !git_ref.is_empty() && !git_ref.contains('/') => (
            &url[..path_start + base.len()],
            Some(git_ref.to_string()),
        ),
        _ => (url, None),
    };

    let name = base
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git")
        .to_string();

    if name.is_empty() || base.is_empty() {
        return Err(ProxyError::InstallFailed {
            reason: format!("cannot determine repository name from '{url}'"),
        });
    }
    Ok((name, git_ref))
}

fn strip_ref<'a>(url: &'a str, git_ref: Option<&str>) -> &'a str {
    let url = url.trim();
    match git_ref {
        Some(git_ref) => url
            .strip_suffix(git_ref)
            .and_then(|u| u.strip_suffix('@'))
            .unwrap_or(url),
        None => url,
    }
}

fn validate_name(name: &str) -> Result<(), ProxyError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if ok {
        Ok(())
    } else {
        Err(ProxyError::InstallFailed {
            reason: format!("invalid server name '{name}'"),
        })
    }
}

/// Find the entry file of a Python MCP server.
///
/// Checks `server.py`, `main.py`, `app.py`, then `*_server.py`, then any
/// top-level file importing fastmcp or mcp.
pub fn detect_server_file(repo: &Path) -> Option<String> {
    for candidate in SERVER_FILE_CANDIDATES {
        if repo.join(candidate).is_file() {
            return Some(candidate.to_string());
        }
    }

    let mut py_files: Vec<String> = std::fs::read_dir(repo)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| name.ends_with(".py"))
        .collect();
    py_files.sort();

    if let Some(server) = py_files.iter().find(|name| name.ends_with("_server.py")) {
        return Some(server.clone());
    }

    py_files.into_iter().find(|name| {
        std::fs::read_to_string(repo.join(name))
            .map(|content| content.to_lowercase().contains("fastmcp") || content.contains("from mcp"))
            .unwrap_or(false)
    })
}

/// The top-level directory under `install_dir` that contains `server_path`.
fn repo_root(install_dir: &Path, server_path: &Path) -> Option<PathBuf> {
    let install_dir = install_dir
        .canonicalize()
        .unwrap_or_else(|_| install_dir.to_path_buf());
    let relative = server_path.strip_prefix(&install_dir).ok()?;
    let first = relative.components().next()?;
    let repo = install_dir.join(first);
    (repo != install_dir && repo.is_dir()).then_some(repo)
}

/// Python interpreter for installs: the active venv, a local venv, or the system one.
fn find_python() -> String {
    let bin = if cfg!(target_os = "windows") {
        "Scripts"
    } else {
        "bin"
    };
    let exe = if cfg!(target_os = "windows") {
        "python.exe"
    } else {
        "python"
    };

    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let python = Path::new(&venv).join(bin).join(exe);
        if python.exists() {
            return python.to_string_lossy().into_owned();
        }
    }

    for dir in ["env", "venv", ".venv"] {
        let python = Path::new(dir).join(bin).join(exe);
        if python.exists() {
            if let Ok(abs) = python.canonicalize() {
                return abs.to_string_lossy().into_owned();
            }
        }
    }

    default_python_command().to_string()
}

/// Platform-correct Python command.
///
/// macOS 12.3+ removed the `python` symlink; only `python3` exists.
/// Windows installs Python as `python.exe` via the official installer.
fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_git_url() {
        let (name, git_ref) = parse_git_url("https://github.com/acme/weather-mcp.git").unwrap();
        assert_eq!(name, "weather-mcp");
        assert_eq!(git_ref, None);

        let (name, git_ref) = parse_git_url("https://github.com/acme/weather-mcp@v1.2").unwrap();
        assert_eq!(name, "weather-mcp");
        assert_eq!(git_ref.as_deref(), Some("v1.2"));

        let (name, git_ref) = parse_git_url("git@github.com:acme/notes.git").unwrap();
        assert_eq!(name, "notes");
        assert_eq!(git_ref, None);

        let (name, git_ref) = parse_git_url("git@github.com:acme/notes.git@main").unwrap();
        assert_eq!(name, "notes");
        assert_eq!(git_ref.as_deref(), Some("main"));

        let (name, _) = parse_git_url("https://example.com/repos/tools/").unwrap();
        assert_eq!(name, "tools");

        assert!(parse_git_url("").is_err());
    }

    #[test]
    fn test_strip_ref() {
        assert_eq!(
            strip_ref("https://github.com/acme/a.git@dev", Some("dev")),
            "https://github.com/acme/a.git"
        );
        assert_eq!(strip_ref("https://github.com/acme/a", None), "https://github.com/acme/a");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("weather").is_ok());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_detect_server_file_prefers_conventional_names() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("weather_server.py"), "").unwrap();
        std::fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(detect_server_file(dir.path()).as_deref(), Some("main.py"));
    }

    #[test]
    fn test_detect_server_file_patterns() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("helpers.py"), "import os\n").unwrap();
        std::fs::write(dir.path().join("weather_server.py"), "").unwrap();
        assert_eq!(
            detect_server_file(dir.path()).as_deref(),
            Some("weather_server.py")
        );

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("helpers.py"), "import os\n").unwrap();
        std::fs::write(dir.path().join("tools.py"), "from fastmcp import FastMCP\n").unwrap();
        assert_eq!(detect_server_file(dir.path()).as_deref(), Some("tools.py"));

        let empty = TempDir::new().unwrap();
        assert_eq!(detect_server_file(empty.path()), None);
    }

    #[tokio::test]
    async fn test_list_and_uninstall_with_files() {
        let dir = TempDir::new().unwrap();
        let install_dir = dir.path().join("servers");
        let repo = install_dir.join("weather");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("server.py"), "").unwrap();
        let server_path = repo.canonicalize().unwrap().join("server.py");

        let config = McpJsonConfig::new(dir.path().join(".mcp.json"));
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "x".to_string());
        config
            .upsert_server(
                "weather",
                ServerConfig {
                    command: "python3".into(),
                    args: vec![server_path.to_string_lossy().into_owned()],
                    env,
                    ..Default::default()
                },
            )
            .unwrap();

        let installer = GitInstaller::new(&install_dir, config).with_python("python3");
        let installed = installer.list_installed().await.unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].name, "weather");
        assert_eq!(installed[0].env_vars, vec!["API_KEY"]);

        let outcome = installer.uninstall("weather", true).await.unwrap();
        assert!(outcome.deleted_path.is_some());
        assert!(!repo.exists());
        assert!(installer.list_installed().await.unwrap().is_empty());

        assert!(matches!(
            installer.uninstall("weather", false).await,
            Err(ProxyError::ConfigNotFound { .. })
        ));
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed: {output:?}");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit(repo: &Path, content: &str) {
        std::fs::write(repo.join("server.py"), content).unwrap();
        git(repo, &["add", "server.py"]);
        git(repo, &["commit", "-q", "-m", content]);
    }

    #[tokio::test]
    async fn test_existing_checkout_switches_to_requested_ref() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        commit(&origin, "v1");
        git(&origin, &["tag", "v1"]);
        commit(&origin, "v2");

        std::fs::create_dir_all(dir.path().join("servers")).unwrap();
        let installer = GitInstaller::new(
            dir.path().join("servers"),
            McpJsonConfig::new(dir.path().join(".mcp.json")),
        );
        let url = origin.to_string_lossy().into_owned();
        let checkout = dir.path().join("servers").join("origin");
        let read = || std::fs::read_to_string(checkout.join("server.py")).unwrap();

        assert!(!installer.fetch(&url, None, &checkout).await.unwrap());
        assert_eq!(read(), "v2");

        assert!(installer.fetch(&url, Some("v1"), &checkout).await.unwrap());
        assert_eq!(read(), "v1");

        commit(&origin, "v3");
        assert!(installer.fetch(&url, Some("main"), &checkout).await.unwrap());
        assert_eq!(read(), "v3");
        assert_eq!(git(&checkout, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    }

    #[tokio::test]
    async fn test_install_rejects_unparseable_url() {
        let dir = TempDir::new().unwrap();
        let installer = GitInstaller::new(
            dir.path().join("servers"),
            McpJsonConfig::new(dir.path().join(".mcp.json")),
        );
        let err = installer
            .ensure_installed(&InstallRequest::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InstallFailed { .. }));
    }
}
