//! The MCP server exposed to upstream clients. Every tool/resource/prompt
//! request is answered straight out of the currently published route
//! map, and every call is forwarded through `middleware::GatewayChain` —
//! this struct itself makes no authentication, authorization, or routing
//! decisions of its own.

use std::future::Future;
use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams, GetPromptResult,
    Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParams, Prompt, ProtocolVersion, ReadResourceRequestParams,
    ReadResourceResult, Resource, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::middleware::GatewayChain;
use crate::registry::RouteRegistry;
use crate::session::CapabilityKind;

/// Upstream-facing MCP server. Cheap to clone — every field is an `Arc`.
#[derive(Clone)]
pub struct GatewayServer {
    chain: Arc<GatewayChain>,
    registry: Arc<RouteRegistry>,
}

impl GatewayServer {
    pub fn new(chain: Arc<GatewayChain>, registry: Arc<RouteRegistry>) -> Self {
        Self { chain, registry }
    }

    async fn dispatch(&self, kind: CapabilityKind, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        self.chain.handle(None, kind, name, arguments).await.map_err(to_mcp_error)
    }

    async fn call(&self, kind: CapabilityKind, name: &str, arguments: Option<Value>) -> Result<Value, GatewayError> {
        self.chain.handle(None, kind, name, arguments).await
    }
}

fn to_mcp_error(error: GatewayError) -> McpError {
    let envelope = error.to_envelope();
    McpError::internal_error(envelope.message, envelope.data)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server aggregates tools, resources, and prompts from multiple backend \
                 MCP servers behind a single route map. Every name returned by tools/list, \
                 resources/list, and prompts/list is already filtered, renamed, and \
                 conflict-resolved — call it exactly as listed."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let snapshot = self.registry.snapshot();
        async move {
            let tools = snapshot
                .list(CapabilityKind::Tool)
                .into_iter()
                .filter_map(|(name, entry)| {
                    serde_json::from_value::<Tool>(json!({
                        "name": name,
                        "description": entry.description,
                        "inputSchema": entry.schema.clone().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }))
                    .ok()
                })
                .collect();
            Ok(ListToolsResult { meta: None, next_cursor: None, tools })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let arguments = request.arguments.map(Value::Object);
        async move {
            match self.call(CapabilityKind::Tool, &request.name, arguments).await {
                Ok(value) => Ok(CallToolResult::success(vec![Content::text(render(&value))])),
                Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_envelope().message)])),
            }
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let snapshot = self.registry.snapshot();
        async move {
            let resources = snapshot
                .list(CapabilityKind::Resource)
                .into_iter()
                .filter_map(|(name, entry)| {
                    serde_json::from_value::<Resource>(json!({
                        "uri": name,
                        "name": name,
                        "description": entry.description,
                    }))
                    .ok()
                })
                .collect();
            Ok(ListResourcesResult { meta: None, next_cursor: None, resources })
        }
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourceTemplatesResult { meta: None, next_cursor: None, resource_templates: Vec::new() }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move {
            let value = self.dispatch(CapabilityKind::Resource, &request.uri, None).await?;
            let contents = serde_json::from_value(json!([{
                "uri": request.uri,
                "text": render(&value),
            }]))
            .map_err(|e: serde_json::Error| McpError::internal_error(e.to_string(), None))?;
            Ok(ReadResourceResult { contents })
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        let snapshot = self.registry.snapshot();
        async move {
            let prompts = snapshot
                .list(CapabilityKind::Prompt)
                .into_iter()
                .filter_map(|(name, entry)| {
                    serde_json::from_value::<Prompt>(json!({
                        "name": name,
                        "description": entry.description,
                    }))
                    .ok()
                })
                .collect();
            Ok(ListPromptsResult { meta: None, next_cursor: None, prompts })
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            let arguments = request.arguments.map(|map| Value::Object(map.into_iter().collect()));
            let value = self.dispatch(CapabilityKind::Prompt, &request.name, arguments).await?;
            let description = value.get("description").and_then(Value::as_str).map(String::from);
            let messages = serde_json::from_value(value.get("messages").cloned().unwrap_or(Value::Array(vec![])))
                .unwrap_or_default();
            Ok(GetPromptResult { description, messages })
        }
    }
}
