//! Aggregating tool router for the Model Context Protocol.
//!
//! The router presents itself to an upstream host as a single MCP server
//! over stdin/stdout while multiplexing `tools/call` requests to a pool
//! of downstream MCP servers it launches as subprocesses. Tool
//! definitions come from a mutable user manifest merged over a read-only
//! community catalog; two intrinsic tools (`configure_mcp_tool`,
//! `search_mcp_servers`) manage that registry in-process. Every
//! invocation is recorded to an append-only usage log.

pub mod client;
pub mod config;
pub mod intrinsics;
pub mod manifest;
pub mod pool;
pub mod resolve;
pub mod rpc;
pub mod server;
pub mod usage;
