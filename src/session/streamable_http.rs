//! Streamable-HTTP backend session, built on rmcp's reqwest-based
//! client transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::*,
    service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::outgoing_auth::AuthHeaders;
use super::{BackendSession, CapabilityKind, DiscoveredCapability, map_call_tool_result, map_tools_to_capabilities};
use crate::config::BackendConfig;

pub struct StreamableHttpSession {
    name: String,
    config: BackendConfig,
    init_timeout: Duration,
    auth: AuthHeaders,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
}

impl StreamableHttpSession {
    pub fn new(name: String, config: BackendConfig, init_timeout: Duration) -> Self {
        let auth = AuthHeaders::from_config(&config.auth, reqwest::Client::new());
        Self {
            name,
            config,
            init_timeout,
            auth,
            service: RwLock::new(None),
        }
    }
}

#[async_trait]
impl BackendSession for StreamableHttpSession {
    async fn initialize(&self) -> Result<()> {
        let url = self
            .config
            .connect
            .url
            .as_deref()
            .context("streamable-http backend missing connect.url")?;

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url);

        let auth_headers = self.auth.resolve().await?;
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in self.config.connect.headers.iter().chain(auth_headers.iter().map(|(k, v)| (k, v))) {
            if key.eq_ignore_ascii_case("Authorization") {
                if let Some(token) = value.strip_prefix("Bearer ") {
                    transport_config = transport_config.auth_header(token);
                    continue;
                }
            }
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(val)) => {
                    default_headers.insert(name, val);
                }
                _ => warn!(backend = %self.name, header = %key, "skipping unparseable header"),
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .context("failed to build HTTP client")?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let service = tokio::time::timeout(self.init_timeout, ().serve(transport))
            .await
            .with_context(|| format!("MCP handshake with backend '{}' timed out", self.name))?
            .with_context(|| format!("failed MCP handshake with backend '{}' at {}", self.name, url))?;

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                url = %url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "streamable-http handshake complete"
            );
        }

        *self.service.write().await = Some(service);
        Ok(())
    }

    async fn list_capabilities(&self, kind: CapabilityKind) -> Result<Vec<DiscoveredCapability>> {
        let guard = self.service.read().await;
        let service = guard.as_ref().context("backend not initialized")?;
        match kind {
            CapabilityKind::Tool => {
                let tools = service
                    .list_all_tools()
                    .await
                    .with_context(|| format!("tool discovery failed for backend '{}'", self.name))?;
                Ok(map_tools_to_capabilities(tools))
            }
            CapabilityKind::Resource | CapabilityKind::Prompt => Ok(Vec::new()),
        }
    }

    async fn call(
        &self,
        kind: CapabilityKind,
        name: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard.as_ref().context("backend not initialized")?;

        match kind {
            CapabilityKind::Tool => {
                let params = CallToolRequestParams {
                    meta: None,
                    name: name.to_string().into(),
                    arguments: arguments.and_then(|v| v.as_object().cloned()),
                    task: None,
                };
                debug!(backend = %self.name, tool = %name, "calling tool via streamable-http");
                let result = tokio::time::timeout(deadline, service.call_tool(params))
                    .await
                    .with_context(|| format!("tool call '{name}' timed out after {deadline:?}"))?
                    .with_context(|| format!("tool call '{name}' failed"))?;
                Ok(map_call_tool_result(result))
            }
            CapabilityKind::Resource | CapabilityKind::Prompt => {
                anyhow::bail!("backend '{}' does not support {:?} yet", self.name, kind)
            }
        }
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.list_capabilities(CapabilityKind::Tool).await?;
        Ok(start.elapsed())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.service.write().await;
        if let Some(service) = guard.take()
            && let Err(e) = service.cancel().await
        {
            warn!(backend = %self.name, error = %e, "error cancelling streamable-http service");
        }
        info!(backend = %self.name, "streamable-http backend stopped");
        Ok(())
    }
}
