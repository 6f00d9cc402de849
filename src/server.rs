//! The parent-facing MCP server frontend.
//!
//! Reads newline-delimited JSON-RPC from the parent, answers the MCP
//! baseline (`initialize`, `ping`, `tools/list`) inline, and fans each
//! `tools/call` out as its own task so slow children never stall the
//! session. All responses funnel through a single writer task; the parent
//! closing stdin drains in-flight calls and releases every child.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::SessionError;
use crate::intrinsics::{self, Intrinsics};
use crate::manifest::{ManifestStore, ToolDefinition};
use crate::pool::{PoolError, SessionPool};
use crate::resolve::{child_identity, resolve_command};
use crate::rpc::{self, CallResult, Request, Response, ToolDescriptor};
use crate::usage::UsageLogger;

/// Internal error for a forwarded call; both variants surface to the
/// parent as `"Error calling tool {name}: {message}"` text content.
#[derive(Debug, Error)]
enum ForwardError {
    #[error(transparent)]
    Startup(#[from] PoolError),
    #[error(transparent)]
    Child(#[from] SessionError),
}

/// The aggregating router: one MCP server backed by a pool of MCP clients.
pub struct Router {
    store: Arc<ManifestStore>,
    intrinsics: Intrinsics,
    pool: Arc<SessionPool>,
    usage: Arc<UsageLogger>,
    root: PathBuf,
}

impl Router {
    /// Wire the frontend to its collaborators.
    pub fn new(
        store: Arc<ManifestStore>,
        pool: Arc<SessionPool>,
        usage: Arc<UsageLogger>,
        root: PathBuf,
    ) -> Self {
        let intrinsics = Intrinsics::new(Arc::clone(&store));
        Self {
            store,
            intrinsics,
            pool,
            usage,
            root,
        }
    }

    /// Serve one parent session over the given byte streams.
    ///
    /// Returns when the parent closes its end, after in-flight calls have
    /// drained and every pooled child has been released.
    pub async fn serve<R, W>(self: Arc<Self>, input: R, output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Response>(64);
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(response) = rx.recv().await {
                match serde_json::to_string(&response) {
                    Ok(mut line) => {
                        line.push('\n');
                        if output.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        if output.flush().await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize response"),
                }
            }
        });

        let mut calls = JoinSet::new();
        let mut lines = BufReader::new(input).lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "unparseable request from parent");
                    let _ = tx
                        .send(Response::error(Value::Null, rpc::PARSE_ERROR, "Parse error"))
                        .await;
                    continue;
                }
            };

            if request.is_notification() {
                self.handle_notification(&request);
                continue;
            }
            let Request {
                id, method, params, ..
            } = request;
            let id = id.unwrap_or(Value::Null);

            match method.as_str() {
                "initialize" => {
                    debug!("parent initialize");
                    let _ = tx.send(Response::result(id, initialize_result())).await;
                }
                "ping" => {
                    let _ = tx.send(Response::result(id, json!({}))).await;
                }
                "tools/list" => {
                    let _ = tx.send(Response::result(id, self.list_tools())).await;
                }
                "tools/call" => {
                    let router = Arc::clone(&self);
                    let tx = tx.clone();
                    calls.spawn(async move {
                        let response = router.handle_call(id, params).await;
                        let _ = tx.send(response).await;
                    });
                }
                other => {
                    debug!(method = other, "unsupported method");
                    let _ = tx
                        .send(Response::error(id, rpc::METHOD_NOT_FOUND, "Method not found"))
                        .await;
                }
            }
        }

        info!("parent transport closed, draining in-flight calls");
        while calls.join_next().await.is_some() {}
        drop(tx);
        let _ = writer.await;
        self.pool.shutdown_all().await;
        Ok(())
    }

    fn handle_notification(&self, request: &Request) {
        match request.method.as_str() {
            "notifications/initialized" => debug!("parent session initialized"),
            other => debug!(method = other, "ignoring notification"),
        }
    }

    /// Intrinsic descriptors first, then the effective registry.
    fn list_tools(&self) -> Value {
        let mut tools = intrinsics::descriptors();
        tools.extend(self.store.load().into_iter().map(|t| ToolDescriptor {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema,
        }));
        json!({ "tools": tools })
    }

    async fn handle_call(&self, id: Value, params: Option<Value>) -> Response {
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Response::error(
                id,
                rpc::INVALID_PARAMS,
                "tools/call requires a 'name' parameter",
            );
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let result = self.dispatch_tool(name, arguments).await;
        match serde_json::to_value(&result) {
            Ok(value) => Response::result(id, value),
            Err(e) => Response::error(id, rpc::INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Route one tool call and record its outcome, whatever happens.
    ///
    /// Failures below the protocol layer come back as text content; the
    /// parent session never sees them as transport faults.
    pub async fn dispatch_tool(&self, name: &str, arguments: Value) -> CallResult {
        let started = Instant::now();

        if intrinsics::is_intrinsic(name) {
            let reply = self.intrinsics.call(name, &arguments).await;
            self.usage.record(
                name,
                reply.error.is_none(),
                started.elapsed(),
                reply.error.as_deref(),
            );
            return match reply.error {
                None => CallResult::text(reply.text),
                Some(_) => CallResult::error_text(reply.text),
            };
        }

        let Some(def) = self.store.load().into_iter().find(|t| t.name == name) else {
            self.usage
                .record(name, false, started.elapsed(), Some("Tool not found"));
            return CallResult::error_text(format!("Tool {name} not found"));
        };

        if def.command.is_empty() {
            self.usage
                .record(name, false, started.elapsed(), Some("tool has no command"));
            return CallResult::error_text(format!(
                "Tool {name} has no command configured; it is listed for discovery only"
            ));
        }

        match self.forward(&def, arguments).await {
            Ok(result) => {
                self.usage.record(name, true, started.elapsed(), None);
                result
            }
            Err(e) => {
                let message = e.to_string();
                self.usage
                    .record(name, false, started.elapsed(), Some(&message));
                CallResult::error_text(format!("Error calling tool {name}: {message}"))
            }
        }
    }

    async fn forward(
        &self,
        def: &ToolDefinition,
        arguments: Value,
    ) -> Result<CallResult, ForwardError> {
        let resolved = resolve_command(&def.command, &def.env, &self.root);
        let identity = child_identity(&resolved.argv, &resolved.env);
        let session = self.pool.acquire(&def.name, &identity, &resolved).await?;
        let result = session.call_tool(&def.name, arguments).await?;
        // The child's content array passes through unchanged.
        Ok(CallResult {
            content: result.content,
            is_error: false,
        })
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": rpc::PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": rpc::SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    /// Shared buffer so tests can read back usage output.
    #[derive(Clone)]
    struct UsageBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl UsageBuf {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
        }

        fn lines(&self) -> Vec<Value> {
            let cursor = self.0.lock().expect("test lock");
            String::from_utf8_lossy(cursor.get_ref())
                .lines()
                .map(|l| serde_json::from_str(l).expect("valid usage JSON"))
                .collect()
        }
    }

    impl Write for UsageBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::io::Write::write(&mut *self.0.lock().expect("test lock"), buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            std::io::Write::flush(&mut *self.0.lock().expect("test lock"))
        }
    }

    fn router_in(dir: &TempDir) -> (Arc<Router>, UsageBuf) {
        let store = Arc::new(ManifestStore::new(
            dir.path().join("router_manifest.json"),
            dir.path().join("community_servers.json"),
        ));
        let usage_buf = UsageBuf::new();
        let usage = Arc::new(UsageLogger::from_writer(Box::new(usage_buf.clone())));
        let pool = Arc::new(SessionPool::new());
        let router = Arc::new(Router::new(store, pool, usage, dir.path().to_path_buf()));
        (router, usage_buf)
    }

    /// Drive a full session: write each request line, collect all response
    /// lines after EOF.
    async fn run_session(router: Arc<Router>, requests: &[Value]) -> Vec<Value> {
        let (mut parent_in, router_in) = tokio::io::duplex(65536);
        let (router_out, mut parent_out) = tokio::io::duplex(65536);

        let server = tokio::spawn(router.serve(router_in, router_out));

        for request in requests {
            let mut line = serde_json::to_string(request).expect("serialize request");
            line.push('\n');
            parent_in
                .write_all(line.as_bytes())
                .await
                .expect("write request");
        }
        drop(parent_in);

        let mut raw = String::new();
        parent_out.read_to_string(&mut raw).await.expect("read responses");
        server.await.expect("join").expect("serve");

        raw.lines()
            .map(|l| serde_json::from_str(l).expect("valid response JSON"))
            .collect()
    }

    fn find_response<'a>(responses: &'a [Value], id: i64) -> &'a Value {
        responses
            .iter()
            .find(|r| r["id"] == json!(id))
            .unwrap_or_else(|| panic!("no response with id {id}"))
    }

    fn call_text(response: &Value) -> &str {
        response["result"]["content"][0]["text"]
            .as_str()
            .expect("text content")
    }

    #[tokio::test]
    async fn test_initialize_reports_router_identity() {
        let dir = TempDir::new().expect("tempdir");
        let (router, _usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{
                "protocolVersion":"2024-11-05","capabilities":{},
                "clientInfo":{"name":"host","version":"1.0"}}})],
        )
        .await;

        let init = find_response(&responses, 1);
        assert_eq!(init["result"]["serverInfo"]["name"], "mcp-manager-router");
        assert!(init["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_list_tools_with_empty_manifests() {
        let dir = TempDir::new().expect("tempdir");
        let (router, _usage) = router_in(&dir);

        let responses =
            run_session(router, &[json!({"jsonrpc":"2.0","id":1,"method":"tools/list"})]).await;

        let tools = find_response(&responses, 1)["result"]["tools"]
            .as_array()
            .expect("tools array")
            .clone();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "configure_mcp_tool");
        assert_eq!(tools[1]["name"], "search_mcp_servers");
    }

    #[tokio::test]
    async fn test_list_tools_user_shadows_community() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("router_manifest.json"),
            r#"{"tools":[{"name":"echo","description":"user echo","command":["user-echo"]}]}"#,
        )
        .expect("write");
        std::fs::write(
            dir.path().join("community_servers.json"),
            r#"{"tools":[
                {"name":"echo","description":"community echo","command":["community-echo"]},
                {"name":"weather","description":"forecasts","command":["weather"]}
            ]}"#,
        )
        .expect("write");
        let (router, _usage) = router_in(&dir);

        let responses =
            run_session(router, &[json!({"jsonrpc":"2.0","id":1,"method":"tools/list"})]).await;

        let tools = find_response(&responses, 1)["result"]["tools"]
            .as_array()
            .expect("tools array")
            .clone();
        let echoes: Vec<&Value> = tools.iter().filter(|t| t["name"] == "echo").collect();
        assert_eq!(echoes.len(), 1, "shadowed tool listed exactly once");
        assert_eq!(echoes[0]["description"], "user echo");
        assert!(tools.iter().any(|t| t["name"] == "weather"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_text_error_and_logged() {
        let dir = TempDir::new().expect("tempdir");
        let (router, usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[json!({"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"ghost","arguments":{}}})],
        )
        .await;

        let response = find_response(&responses, 1);
        assert_eq!(call_text(response), "Tool ghost not found");
        assert!(response["result"]["isError"].as_bool().unwrap_or(false));

        let records = usage.lines();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tool"], "ghost");
        assert_eq!(records[0]["success"], false);
        assert_eq!(records[0]["error"], "Tool not found");
    }

    #[tokio::test]
    async fn test_discovery_only_entry_cannot_be_invoked() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("community_servers.json"),
            r#"{"tools":[{"name":"someday","description":"not yet runnable"}]}"#,
        )
        .expect("write");
        let (router, usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[json!({"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"someday","arguments":{}}})],
        )
        .await;

        let text = call_text(find_response(&responses, 1));
        assert!(text.contains("no command"), "got: {text}");
        assert_eq!(usage.lines()[0]["error"], "tool has no command");
    }

    #[tokio::test]
    async fn test_forwarded_call_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let script = concat!(
            r#"read line; "#,
            r#"echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"1.0"}}}'; "#,
            r#"read line; "#,
            r#"read line; "#,
            r#"echo '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"pong"}]}}'; "#,
        );
        let manifest = json!({"tools":[{
            "name": "pinger",
            "description": "answers pong",
            "command": ["bash", "-c", script],
        }]});
        std::fs::write(
            dir.path().join("router_manifest.json"),
            serde_json::to_string(&manifest).expect("serialize"),
        )
        .expect("write");
        let (router, usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[json!({"jsonrpc":"2.0","id":7,"method":"tools/call",
                     "params":{"name":"pinger","arguments":{"probe":true}}})],
        )
        .await;

        let response = find_response(&responses, 7);
        assert_eq!(call_text(response), "pong");
        assert_eq!(response["result"]["isError"], false);

        let records = usage.lines();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tool"], "pinger");
        assert_eq!(records[0]["success"], true);
    }

    #[tokio::test]
    async fn test_child_startup_failure_is_text_error() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("router_manifest.json"),
            r#"{"tools":[{"name":"crasher","command":["bash","-c","exit 5"]}]}"#,
        )
        .expect("write");
        let (router, usage) = router_in(&dir);

        let responses = run_session(
            Arc::clone(&router),
            &[json!({"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"crasher","arguments":{}}})],
        )
        .await;

        let text = call_text(find_response(&responses, 1));
        assert!(
            text.starts_with("Error calling tool crasher:"),
            "got: {text}"
        );
        assert_eq!(usage.lines()[0]["success"], false);
    }

    #[tokio::test]
    async fn test_intrinsic_calls_are_logged() {
        let dir = TempDir::new().expect("tempdir");
        let (router, usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[json!({"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"search_mcp_servers","arguments":{"query":"x"}}})],
        )
        .await;

        let hits: Vec<Value> =
            serde_json::from_str(call_text(find_response(&responses, 1))).expect("JSON payload");
        assert!(hits.is_empty());

        let records = usage.lines();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tool"], "search_mcp_servers");
        assert_eq!(records[0]["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_method_and_parse_error() {
        let dir = TempDir::new().expect("tempdir");
        let (router, _usage) = router_in(&dir);

        let (mut parent_in, router_in_half) = tokio::io::duplex(4096);
        let (router_out, mut parent_out) = tokio::io::duplex(4096);
        let server = tokio::spawn(router.serve(router_in_half, router_out));

        parent_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"resources/list\"}\nnot json at all\n")
            .await
            .expect("write");
        drop(parent_in);

        let mut raw = String::new();
        parent_out.read_to_string(&mut raw).await.expect("read");
        server.await.expect("join").expect("serve");

        let responses: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("valid JSON"))
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32601);
        assert_eq!(responses[1]["error"]["code"], -32700);
        assert!(responses[1]["id"].is_null());
    }

    #[tokio::test]
    async fn test_ping_and_notification_handling() {
        let dir = TempDir::new().expect("tempdir");
        let (router, _usage) = router_in(&dir);

        let responses = run_session(
            router,
            &[
                json!({"jsonrpc":"2.0","method":"notifications/initialized"}),
                json!({"jsonrpc":"2.0","id":2,"method":"ping"}),
            ],
        )
        .await;

        // The notification produced no response line.
        assert_eq!(responses.len(), 1);
        assert!(find_response(&responses, 2)["result"]
            .as_object()
            .expect("object")
            .is_empty());
    }
}
