//! Outer command surface: the proxy as an MCP server over stdio.
//!
//! The client sees a fixed set of meta-tools (`load_mcp_server_dynamically`,
//! `call_dynamic_server_tool`, ...) that drive the `ProxyCore`.

pub mod server;
pub mod tools;

pub use server::CommandServer;
pub use tools::CommandContext;
