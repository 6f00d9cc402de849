//! Router filesystem layout.
//!
//! Everything the router touches on disk lives under one root: the user
//! manifest, the community catalog, and the usage log. The root comes
//! from `MCP_ROUTER_ROOT`, falling back to the working directory, so the
//! router behaves the same whether a host launches it from anywhere or an
//! operator runs it in place.

use std::path::PathBuf;

/// Environment variable selecting the router root.
pub const ROOT_ENV: &str = "MCP_ROUTER_ROOT";

/// User manifest file name, relative to the root.
pub const USER_MANIFEST_FILE: &str = "router_manifest.json";

/// Community catalog file name, relative to the root.
pub const COMMUNITY_CATALOG_FILE: &str = "community_servers.json";

/// Log directory name, relative to the root.
pub const LOGS_DIR: &str = "logs";

/// Usage log file name, relative to the log directory.
pub const USAGE_LOG_FILE: &str = "usage.jsonl";

/// Resolved locations of the router's on-disk artifacts.
#[derive(Debug, Clone)]
pub struct RouterPaths {
    /// Root directory; relative manifest commands resolve against it.
    pub root: PathBuf,
    /// The mutable user manifest.
    pub user_manifest: PathBuf,
    /// The read-only community catalog.
    pub community_catalog: PathBuf,
    /// The append-only usage log.
    pub usage_log: PathBuf,
}

impl RouterPaths {
    /// Resolve the root from `MCP_ROUTER_ROOT` or the working directory.
    pub fn resolve() -> std::io::Result<Self> {
        let root = match std::env::var_os(ROOT_ENV) {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir()?,
        };
        Ok(Self::from_root(root))
    }

    /// Derive all artifact paths from an explicit root.
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            user_manifest: root.join(USER_MANIFEST_FILE),
            community_catalog: root.join(COMMUNITY_CATALOG_FILE),
            usage_log: root.join(LOGS_DIR).join(USAGE_LOG_FILE),
            root,
        }
    }

    /// Create the log directory if absent.
    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root.join(LOGS_DIR))
    }
}
