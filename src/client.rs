//! Downstream MCP client session over a child process's stdin/stdout.
//!
//! Each child is spawned with piped stdio and spoken to in newline-delimited
//! JSON-RPC. A dedicated reader task routes responses back to callers by
//! request id, so concurrent `tools/call` forwards multiplex over a single
//! child without serializing on it. A stderr drain surfaces the child's
//! diagnostics on the router's own error stream, tagged with the tool name.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::resolve::ResolvedCommand;
use crate::rpc::{self, CallResult, ErrorObject};

/// Errors from a downstream session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The child process could not be started.
    #[error("failed to spawn child: {0}")]
    Spawn(String),

    /// I/O error writing to the child.
    #[error("child transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON crossing the child transport.
    #[error("child transport JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The child answered with a JSON-RPC error object.
    #[error("child returned error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the child.
        message: String,
    },

    /// The child closed its stdout or broke framing; the session is dead.
    #[error("child closed the transport")]
    Closed,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ErrorObject>>>>;

/// A live MCP session with one downstream child.
///
/// All methods take `&self`; the session is shared behind an [`Arc`] by
/// every in-flight call that resolved to the same child identity.
#[derive(Debug)]
pub struct ChildSession {
    name: String,
    identity: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Child>,
    reader: JoinHandle<()>,
    stderr_pump: Option<JoinHandle<()>>,
}

impl ChildSession {
    /// Spawn the child and start its stdio pumps.
    ///
    /// The returned session has not yet performed the MCP handshake;
    /// callers must [`initialize`](Self::initialize) before forwarding
    /// tool calls.
    pub fn spawn(
        name: &str,
        identity: &str,
        resolved: &ResolvedCommand,
    ) -> Result<Self, SessionError> {
        let Some((program, args)) = resolved.argv.split_first() else {
            return Err(SessionError::Spawn("empty command vector".to_owned()));
        };

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(&resolved.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("failed to capture stdin".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("failed to capture stdout".to_owned()))?;
        let stderr = child.stderr.take();

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(pump_stdout(
            name.to_owned(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        let stderr_pump = stderr.map(|stderr| {
            let child_name = name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(child = %child_name, "{line}");
                }
            })
        });

        Ok(Self {
            name: name.to_owned(),
            identity: identity.to_owned(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            child: tokio::sync::Mutex::new(child),
            reader,
            stderr_pump,
        })
    }

    /// The identity hash this session is pooled under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the transport is still believed usable.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Perform the MCP `initialize` handshake, then signal readiness with
    /// `notifications/initialized`.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let params = json!({
            "protocolVersion": rpc::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": rpc::SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.call("initialize", Some(params)).await?;
        self.notify("notifications/initialized", None).await
    }

    /// Forward a `tools/call` to the child.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallResult, SessionError> {
        let result = self
            .call(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request and wait for its matching response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let request = rpc::ClientRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        if let Err(e) = self.write_line(&serde_json::to_vec(&request)?).await {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SessionError::Server {
                code: err.code,
                message: err.message,
            }),
            // Sender dropped: the reader died before answering us.
            Err(_) => Err(SessionError::Closed),
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let notification = rpc::ClientNotification {
            jsonrpc: "2.0",
            method,
            params,
        };
        self.write_line(&serde_json::to_vec(&notification)?).await
    }

    async fn write_line(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Tear the session down: stop the pumps and kill the child.
    ///
    /// Safe to call more than once; errors from an already-dead child are
    /// ignored.
    pub async fn release(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Some(pump) = &self.stderr_pump {
            pump.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(child = %self.name, error = %e, "kill on release failed");
        }
    }
}

impl Drop for ChildSession {
    fn drop(&mut self) {
        // The process itself dies via kill_on_drop.
        self.reader.abort();
        if let Some(pump) = &self.stderr_pump {
            pump.abort();
        }
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, ErrorObject>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read the child's stdout, routing each response to its waiting caller.
///
/// EOF or a framing error marks the session dead and drops every pending
/// sender, which wakes the corresponding callers with [`SessionError::Closed`].
async fn pump_stdout(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(child = %name, "child stdout closed");
                break;
            }
            Err(e) => {
                warn!(child = %name, error = %e, "child stdout read failed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response: rpc::ClientResponse = match serde_json::from_str(trimmed) {
            Ok(response) => response,
            Err(e) => {
                warn!(child = %name, error = %e, "unparseable frame from child");
                break;
            }
        };

        // Notifications and null ids are not ours to route.
        let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
            debug!(child = %name, "skipping child notification");
            continue;
        };

        let sender = lock_pending(&pending).remove(&id);
        match sender {
            Some(tx) => {
                let outcome = match response.error {
                    Some(err) => Err(err),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => debug!(child = %name, id, "response for unknown request id"),
        }
    }
    alive.store(false, Ordering::SeqCst);
    lock_pending(&pending).clear();
}
