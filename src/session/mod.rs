//! Backend session contract: the narrow surface the client manager and
//! health checker drive, independent of which wire transport backs it.
//!
//! A `BackendSession` owns exactly one live connection to one backend
//! MCP server. It never knows about routing, filtering, or the route
//! map — those live one layer up, in `client_manager`.

pub mod outgoing_auth;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// The three capability kinds a backend can advertise, mirroring the
/// route map's per-kind split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// One capability as discovered directly from a backend, before any
/// filtering, renaming, or conflict resolution is applied.
#[derive(Debug, Clone)]
pub struct DiscoveredCapability {
    pub kind: CapabilityKind,
    pub original_name: String,
    pub description: Option<String>,
    pub schema: Option<Value>,
}

/// A live connection to one backend MCP server, regardless of transport.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Perform the MCP initialize handshake. Must be called once before
    /// any other method.
    async fn initialize(&self) -> Result<()>;

    /// List everything this backend currently advertises of the given kind.
    async fn list_capabilities(&self, kind: CapabilityKind) -> Result<Vec<DiscoveredCapability>>;

    /// Invoke a capability by its name at the backend (i.e. after the
    /// route map has already translated exposed name back to original
    /// name). `method` distinguishes tool calls from resource reads and
    /// prompt fetches.
    async fn call(
        &self,
        kind: CapabilityKind,
        name: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value>;

    /// Lightweight liveness probe used by the health checker. Backends
    /// without a dedicated ping fall back to a capability listing.
    async fn ping(&self) -> Result<Duration>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Map an rmcp `CallToolResult` into the plain JSON value the rest of the
/// gateway works with.
pub(crate) fn map_call_tool_result(result: rmcp::model::CallToolResult) -> Value {
    use rmcp::model::RawContent;
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();
    if contents.len() == 1 {
        contents.into_iter().next().unwrap()
    } else {
        Value::Array(contents)
    }
}

pub(crate) fn map_tools_to_capabilities(tools: Vec<rmcp::model::Tool>) -> Vec<DiscoveredCapability> {
    tools
        .into_iter()
        .map(|t| DiscoveredCapability {
            kind: CapabilityKind::Tool,
            original_name: t.name.to_string(),
            description: t.description.map(|d| d.to_string()),
            schema: Some(
                serde_json::to_value(&t.input_schema).unwrap_or(Value::Object(Default::default())),
            ),
        })
        .collect()
}
