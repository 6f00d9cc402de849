//! Tool manifests — the user manifest, the community catalog, and the
//! effective registry merged from both.
//!
//! The user manifest (`router_manifest.json`) is authoritative and mutable;
//! the community catalog (`community_servers.json`) is supplemental and
//! read-only for the router. Merging is user-precedence by tool name.
//! A malformed or missing file never takes the router down: it is reported
//! on stderr and treated as empty.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors from manifest persistence.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Filesystem error reading or writing a manifest file.
    #[error("manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while saving.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One entry of the tool registry.
///
/// `command` may be empty for community entries that exist only for
/// discovery; such tools are listed but cannot be invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name; also the name the child is expected to expose.
    pub name: String,
    /// Human-readable description; may be empty.
    #[serde(default)]
    pub description: String,
    /// Executable and arguments; index 0 is the executable.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment overlay applied to the child process, literal values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// JSON Schema for the tool input, opaque to the router.
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({})
}

/// An ordered list of tool definitions, as persisted on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Tool definitions in file order.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

impl Manifest {
    /// Find a tool by name.
    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Loads and persists the two manifest files.
///
/// Files are re-read on every load so that external edits (a scraper
/// rewriting the catalog, a human editing the manifest) are observed on
/// the next call without restart.
pub struct ManifestStore {
    user_path: PathBuf,
    community_path: PathBuf,
}

impl ManifestStore {
    /// Create a store over the given user manifest and community catalog paths.
    pub fn new(user_path: PathBuf, community_path: PathBuf) -> Self {
        Self {
            user_path,
            community_path,
        }
    }

    /// Load the user manifest; missing or malformed files read as empty.
    pub fn load_user(&self) -> Manifest {
        read_manifest(&self.user_path)
    }

    /// Load the community catalog; missing or malformed files read as empty.
    pub fn load_community(&self) -> Manifest {
        read_manifest(&self.community_path)
    }

    /// Compute the effective registry: user entries in file order, then
    /// community entries whose name the user set does not already claim.
    pub fn load(&self) -> Vec<ToolDefinition> {
        let mut tools = self.load_user().tools;
        let taken: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
        tools.extend(
            self.load_community()
                .tools
                .into_iter()
                .filter(|t| !taken.contains(&t.name)),
        );
        tools
    }

    /// Persist the user manifest atomically.
    ///
    /// Serializes with 2-space indentation and stable field order, writes
    /// to a sibling `.tmp` file, then renames over the target so a reader
    /// never observes a torn document.
    pub fn save_user(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let mut body = serde_json::to_string_pretty(manifest)?;
        body.push('\n');
        let tmp_path = self.user_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.user_path)?;
        Ok(())
    }
}

/// Read a manifest file, degrading to empty on absence or corruption.
fn read_manifest(path: &Path) -> Manifest {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Manifest::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read manifest");
            return Manifest::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed manifest, treating as empty");
            Manifest::default()
        }
    }
}
