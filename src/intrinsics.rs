//! The router's two built-in tools.
//!
//! `configure_mcp_tool` installs a community entry into the user manifest
//! (or updates its env) and persists it; `search_mcp_servers` filters the
//! community catalog by substring. Both are always listed, shadow any
//! downstream tool of the same name, and report failures as text rather
//! than protocol faults.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::manifest::ManifestStore;
use crate::rpc::ToolDescriptor;

/// Name of the install/configure intrinsic.
pub const CONFIGURE_TOOL: &str = "configure_mcp_tool";

/// Name of the catalog search intrinsic.
pub const SEARCH_TOOL: &str = "search_mcp_servers";

/// Whether `name` is handled in-process.
pub fn is_intrinsic(name: &str) -> bool {
    name == CONFIGURE_TOOL || name == SEARCH_TOOL
}

/// The two intrinsic descriptors, in listing order.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: CONFIGURE_TOOL.to_owned(),
            description: "Install or Configure an MCP tool. Use this to permanently add a \
                          tool from the registry to the manifest, or to save environment \
                          variables (like API keys)."
                .to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "description": "Name of the tool to install/configure (e.g. 'weather', 'brave_search')"
                    },
                    "env": {
                        "type": "object",
                        "additionalProperties": {"type": "string"},
                        "description": "Optional: Key-value pairs of environment variables. Leave empty if just installing."
                    }
                },
                "required": ["name"]
            }),
        },
        ToolDescriptor {
            name: SEARCH_TOOL.to_owned(),
            description: "CRITICAL: Use this tool whenever you lack the necessary tools, \
                          skills, or knowledge to complete a user request. It searches the \
                          expanded MCP registry to find and install new capabilities (e.g. \
                          'browser', 'database', 'slack') on the fly."
                .to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query for the missing capability (e.g. 'weather', 'database', 'browser')"
                    }
                },
                "required": ["query"]
            }),
        },
    ]
}

/// Outcome of an intrinsic call: the text shown to the caller, plus the
/// short diagnostic recorded in the usage log when the call failed.
#[derive(Debug)]
pub struct IntrinsicReply {
    /// Text content returned to the parent.
    pub text: String,
    /// `Some` when the reply encodes an error.
    pub error: Option<String>,
}

impl IntrinsicReply {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: None,
        }
    }

    fn err(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: Some(error.into()),
        }
    }
}

/// In-process handlers for the intrinsic tools.
pub struct Intrinsics {
    store: Arc<ManifestStore>,
    // configure_mcp_tool must complete one save before another begins.
    save_lock: Mutex<()>,
}

impl Intrinsics {
    /// Create the handlers over the shared manifest store.
    pub fn new(store: Arc<ManifestStore>) -> Self {
        Self {
            store,
            save_lock: Mutex::new(()),
        }
    }

    /// Dispatch an intrinsic by name. Callers must have checked
    /// [`is_intrinsic`] first.
    pub async fn call(&self, name: &str, arguments: &Value) -> IntrinsicReply {
        match name {
            CONFIGURE_TOOL => self.configure(arguments).await,
            SEARCH_TOOL => self.search(arguments),
            other => IntrinsicReply::err(
                format!("Error: '{other}' is not an intrinsic tool."),
                "not an intrinsic tool",
            ),
        }
    }

    /// Install a community entry into the user manifest, or update its env.
    async fn configure(&self, arguments: &Value) -> IntrinsicReply {
        let Some(tool_name) = arguments.get("name").and_then(Value::as_str) else {
            return IntrinsicReply::err(
                "Error configuring tool: missing required argument 'name'",
                "missing required argument 'name'",
            );
        };
        let new_env: BTreeMap<String, String> = arguments
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default();

        let _guard = self.save_lock.lock().await;

        let mut user = self.store.load_user();
        if user.find(tool_name).is_none() {
            let community = self.store.load_community();
            if let Some(community_entry) = community.find(tool_name) {
                user.tools.push(community_entry.clone());
            }
        }
        let Some(entry) = user.tools.iter_mut().find(|t| t.name == tool_name) else {
            return IntrinsicReply::err(
                format!("Error: Tool '{tool_name}' not found in registry."),
                "tool not found in registry",
            );
        };

        // Shallow overlay; empty-string values stay literal values.
        entry.env.extend(new_env);

        if let Err(e) = self.store.save_user(&user) {
            return IntrinsicReply::err(
                format!("Error configuring tool: {e}"),
                format!("save failed: {e}"),
            );
        }

        IntrinsicReply::ok(format!(
            "Successfully configured and saved settings for '{tool_name}'."
        ))
    }

    /// Filter the community catalog by case-insensitive substring.
    fn search(&self, arguments: &Value) -> IntrinsicReply {
        let Some(query) = arguments.get("query").and_then(Value::as_str) else {
            return IntrinsicReply::err(
                "Error searching registry: missing required argument 'query'",
                "missing required argument 'query'",
            );
        };
        let query = query.to_lowercase();

        let hits: Vec<Value> = self
            .store
            .load_community()
            .tools
            .into_iter()
            .filter(|t| {
                t.name.to_lowercase().contains(&query)
                    || t.description.to_lowercase().contains(&query)
            })
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "command_preview": t.command.join(" "),
                    "inputSchema": t.input_schema,
                })
            })
            .collect();

        match serde_json::to_string_pretty(&hits) {
            Ok(text) => IntrinsicReply::ok(text),
            Err(e) => IntrinsicReply::err(
                format!("Error searching registry: {e}"),
                format!("serialization failed: {e}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(community: &str) -> (TempDir, Intrinsics, Arc<ManifestStore>) {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("community_servers.json"), community).expect("write");
        let store = Arc::new(ManifestStore::new(
            dir.path().join("router_manifest.json"),
            dir.path().join("community_servers.json"),
        ));
        let intrinsics = Intrinsics::new(Arc::clone(&store));
        (dir, intrinsics, store)
    }

    const CATALOG: &str = r#"{"tools":[
        {"name":"weather-mcp","description":"14-day forecasts","command":["weather"]},
        {"name":"echo","description":"Echo test server","command":["bin/echo-mcp"],
         "inputSchema":{"type":"object","properties":{"message":{"type":"string"}}}},
        {"name":"discovery-only","description":"No command yet"}
    ]}"#;

    #[test]
    fn test_descriptors_order_and_names() {
        let descriptors = descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, CONFIGURE_TOOL);
        assert_eq!(descriptors[1].name, SEARCH_TOOL);
        assert_eq!(descriptors[0].input_schema["required"][0], "name");
        assert_eq!(descriptors[1].input_schema["required"][0], "query");
    }

    #[test]
    fn test_is_intrinsic() {
        assert!(is_intrinsic(CONFIGURE_TOOL));
        assert!(is_intrinsic(SEARCH_TOOL));
        assert!(!is_intrinsic("weather-mcp"));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let (_dir, intrinsics, _store) = fixture(CATALOG);

        let reply = intrinsics
            .call(SEARCH_TOOL, &json!({"query": "WEATHER"}))
            .await;
        assert!(reply.error.is_none());

        let hits: Vec<Value> = serde_json::from_str(&reply.text).expect("JSON payload");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["name"], "weather-mcp");
        assert_eq!(hits[0]["command_preview"], "weather");
        assert_eq!(hits[0]["description"], "14-day forecasts");
    }

    #[tokio::test]
    async fn test_search_matches_description_too() {
        let (_dir, intrinsics, _store) = fixture(CATALOG);

        let reply = intrinsics
            .call(SEARCH_TOOL, &json!({"query": "forecast"}))
            .await;
        let hits: Vec<Value> = serde_json::from_str(&reply.text).expect("JSON payload");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["name"], "weather-mcp");
    }

    #[tokio::test]
    async fn test_search_no_hits_is_empty_array() {
        let (_dir, intrinsics, _store) = fixture(CATALOG);

        let reply = intrinsics
            .call(SEARCH_TOOL, &json!({"query": "quantum"}))
            .await;
        assert!(reply.error.is_none());
        let hits: Vec<Value> = serde_json::from_str(&reply.text).expect("JSON payload");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_missing_query() {
        let (_dir, intrinsics, _store) = fixture(CATALOG);
        let reply = intrinsics.call(SEARCH_TOOL, &json!({})).await;
        assert!(reply.error.is_some());
        assert!(reply.text.starts_with("Error searching registry"));
    }

    #[tokio::test]
    async fn test_configure_installs_from_community() {
        let (_dir, intrinsics, store) = fixture(CATALOG);

        let reply = intrinsics
            .call(
                CONFIGURE_TOOL,
                &json!({"name": "echo", "env": {"K": "V"}}),
            )
            .await;
        assert!(reply.error.is_none(), "unexpected error: {:?}", reply.error);
        assert_eq!(
            reply.text,
            "Successfully configured and saved settings for 'echo'."
        );

        let user = store.load_user();
        let entry = user.find("echo").expect("echo installed");
        assert_eq!(entry.command, vec!["bin/echo-mcp"]);
        assert_eq!(entry.env.get("K").map(String::as_str), Some("V"));
        // The community schema came along with the deep copy.
        assert_eq!(entry.input_schema["properties"]["message"]["type"], "string");
    }

    #[tokio::test]
    async fn test_configure_updates_existing_env() {
        let (_dir, intrinsics, store) = fixture(CATALOG);

        intrinsics
            .call(CONFIGURE_TOOL, &json!({"name": "echo", "env": {"A": "1", "B": "2"}}))
            .await;
        intrinsics
            .call(CONFIGURE_TOOL, &json!({"name": "echo", "env": {"B": "3"}}))
            .await;

        let user = store.load_user();
        assert_eq!(user.tools.len(), 1, "no duplicate entries");
        let entry = user.find("echo").expect("echo entry");
        assert_eq!(entry.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(entry.env.get("B").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_configure_empty_string_env_value_kept() {
        let (_dir, intrinsics, store) = fixture(CATALOG);

        intrinsics
            .call(CONFIGURE_TOOL, &json!({"name": "echo", "env": {"K": ""}}))
            .await;

        let entry_env = store.load_user().find("echo").expect("entry").env.clone();
        assert_eq!(entry_env.get("K").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_configure_unknown_tool() {
        let (_dir, intrinsics, store) = fixture(CATALOG);

        let reply = intrinsics
            .call(CONFIGURE_TOOL, &json!({"name": "nonexistent"}))
            .await;
        assert!(reply.error.is_some());
        assert_eq!(
            reply.text,
            "Error: Tool 'nonexistent' not found in registry."
        );
        assert!(store.load_user().tools.is_empty(), "nothing persisted");
    }

    #[tokio::test]
    async fn test_concurrent_configures_all_persist() {
        let dir = TempDir::new().expect("tempdir");
        let mut tools = Vec::new();
        for i in 0..8 {
            tools.push(json!({"name": format!("tool-{i}"), "command": ["true"]}));
        }
        std::fs::write(
            dir.path().join("community_servers.json"),
            serde_json::to_string(&json!({"tools": tools})).expect("serialize"),
        )
        .expect("write");

        let store = Arc::new(ManifestStore::new(
            dir.path().join("router_manifest.json"),
            dir.path().join("community_servers.json"),
        ));
        let intrinsics = Arc::new(Intrinsics::new(Arc::clone(&store)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let intrinsics = Arc::clone(&intrinsics);
            handles.push(tokio::spawn(async move {
                intrinsics
                    .call(CONFIGURE_TOOL, &json!({"name": format!("tool-{i}")}))
                    .await
            }));
        }
        for handle in handles {
            let reply = handle.await.expect("join");
            assert!(reply.error.is_none(), "configure failed: {:?}", reply.error);
        }

        let user = store.load_user();
        assert_eq!(user.tools.len(), 8, "every configured tool persisted");
    }
}
