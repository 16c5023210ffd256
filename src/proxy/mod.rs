//! MCP Proxy: dynamic loading of MCP servers behind a single stdio endpoint.
//!
//! This module handles:
//! - Spawning worker MCP servers and performing the MCP handshake
//! - JSON-RPC 2.0 framing and request/response correlation over worker stdio
//! - Load, reload (overlap or restart), and unload of workers at runtime
//! - Tool discovery and search across every loaded worker
//! - Installing servers from git and registering them in `.mcp.json`
//!
//! `ProxyCore` is the entry point used by the command layer.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod handle;
pub mod index;
pub mod installer;
pub mod loader;
pub mod registry;
pub mod schema;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigStore, McpJsonConfig, MemoryConfigStore, ServerConfig};
pub use errors::ProxyError;
pub use handle::{HandleTimeouts, WorkerHandle, WorkerState};
pub use index::{SearchHit, ToolIndex};
pub use installer::{GitInstaller, InstallRequest, Installer};
pub use loader::{CoreOptions, ProxyCore};
pub use registry::{WorkerRegistry, WorkerStatus};
pub use transport::Framing;
pub use types::{LaunchSpec, ReloadStrategy, ToolCallResult, ToolManifestEntry};
