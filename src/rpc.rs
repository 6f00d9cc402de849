//! JSON-RPC 2.0 wire types shared by both MCP roles.
//!
//! The router speaks the same newline-delimited JSON-RPC dialect in two
//! directions: as a server to its parent on stdin/stdout, and as a client
//! to each downstream child. Requests, responses, and the MCP payload
//! shapes (`tools/list` descriptors, `tools/call` content) live here so
//! neither side redefines them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised during the MCP handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported to the parent in `initialize`.
pub const SERVER_NAME: &str = "mcp-manager-router";

/// JSON-RPC 2.0 `Parse error`.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC 2.0 `Invalid Request`.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC 2.0 `Method not found`.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC 2.0 `Invalid params`.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC 2.0 `Internal error`.
pub const INTERNAL_ERROR: i64 = -32603;

/// An incoming JSON-RPC message from the parent.
///
/// Requests carry an `id`; notifications do not. The id is kept as an
/// opaque [`Value`] because hosts are free to use numbers or strings,
/// and the response must echo it verbatim.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol marker, expected to be `"2.0"`.
    pub jsonrpc: Option<String>,
    /// Request id; `None` for notifications.
    pub id: Option<Value>,
    /// Method name (e.g. `tools/call`).
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<Value>,
}

impl Request {
    /// Whether this message is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none() || self.id.as_ref().is_some_and(Value::is_null)
    }
}

/// An outgoing JSON-RPC response to the parent.
#[derive(Debug, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl Response {
    /// Build a success response echoing the request id.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing the request id.
    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// An outgoing JSON-RPC request to a child (client role).
///
/// Child-bound ids are always sequential integers assigned by the session.
#[derive(Debug, Serialize)]
pub struct ClientRequest<'a> {
    /// Protocol marker, always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Request id.
    pub id: u64,
    /// Method name.
    pub method: &'a str,
    /// Method parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// An outgoing JSON-RPC notification (no id, no response expected).
#[derive(Debug, Serialize)]
pub struct ClientNotification<'a> {
    /// Protocol marker, always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: &'a str,
    /// Method parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// An incoming JSON-RPC response from a child.
#[derive(Debug, Deserialize)]
pub struct ClientResponse {
    /// Response id; absent on notifications from the child.
    pub id: Option<Value>,
    /// Result payload on success.
    pub result: Option<Value>,
    /// Error object on failure.
    pub error: Option<ErrorObject>,
}

// ── MCP payload types ──

/// A tool descriptor as listed to the parent via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Externally visible tool name.
    pub name: String,
    /// Human-readable description; may be empty.
    pub description: String,
    /// JSON Schema for the tool input, forwarded verbatim.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A single content block in a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    /// Content type (`"text"`, `"image"`, `"resource"`).
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text payload for `type == "text"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Any further fields a child attached; forwarded unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentItem {
    /// Build a plain text content item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_owned(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// Result payload of a `tools/call`, in either role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    /// Content blocks returned by the tool.
    #[serde(default)]
    pub content: Vec<ContentItem>,
    /// Whether the invocation was an error.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallResult {
    /// Build a single-text success result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    /// Build a single-text error result.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: true,
        }
    }
}
