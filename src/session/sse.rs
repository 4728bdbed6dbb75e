//! SSE backend session.
//!
//! The gateway's backend-facing SSE transport predates Streamable HTTP
//! becoming the default in most MCP servers but several backends still
//! only speak it: a POST channel for outgoing messages and a GET/SSE
//! channel the backend pushes responses and notifications down. There is
//! no off-the-shelf rmcp client transport for this direction, so this
//! session drives the event stream directly with `sse-stream` over a
//! plain `reqwest` client and does its own MCP JSON-RPC framing.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use sse_stream::SseStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use super::outgoing_auth::AuthHeaders;
use super::{BackendSession, CapabilityKind, DiscoveredCapability};
use crate::config::BackendConfig;

type PendingMap = Arc<Mutex<std::collections::HashMap<u64, oneshot::Sender<Value>>>>;

pub struct SseSession {
    name: String,
    config: BackendConfig,
    startup_timeout: Duration,
    auth: AuthHeaders,
    http: reqwest::Client,
    post_url: Mutex<Option<String>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl SseSession {
    pub fn new(name: String, config: BackendConfig, startup_timeout: Duration) -> Self {
        let http = reqwest::Client::new();
        let auth = AuthHeaders::from_config(&config.auth, http.clone());
        Self {
            name,
            config,
            startup_timeout,
            auth,
            http,
            post_url: Mutex::new(None),
            pending: Arc::new(Mutex::new(std::collections::HashMap::new())),
            next_id: AtomicU64::new(1),
            reader_shutdown: Mutex::new(None),
        }
    }

    async fn request_headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in self.config.connect.headers.iter() {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }
        for (key, value) in self.auth.resolve().await? {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }
        Ok(headers)
    }

    async fn send_request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let post_url = self
            .post_url
            .lock()
            .await
            .clone()
            .context("SSE backend endpoint not yet established")?;

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let headers = self.request_headers().await?;
        let response = self
            .http
            .post(&post_url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST to SSE backend '{}' failed", self.name))?;
        if !response.status().is_success() {
            self.pending.lock().await.remove(&id);
            anyhow::bail!("SSE backend '{}' returned status {}", self.name, response.status());
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(anyhow!("SSE backend '{}' closed before responding", self.name))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(anyhow!("request to SSE backend '{}' timed out after {deadline:?}", self.name))
            }
        }
    }
}

#[async_trait]
impl BackendSession for SseSession {
    async fn initialize(&self) -> Result<()> {
        let url = self
            .config
            .connect
            .url
            .as_deref()
            .context("sse backend missing connect.url")?
            .to_string();

        let headers = self.request_headers().await?;
        let response = self
            .http
            .get(&url)
            .headers(headers)
            .send()
            .await
            .with_context(|| format!("failed to open SSE stream for backend '{}'", self.name))?;
        if !response.status().is_success() {
            anyhow::bail!("SSE backend '{}' returned status {}", self.name, response.status());
        }

        let byte_stream = response.bytes_stream();
        let mut events = SseStream::from_bytes_stream(byte_stream);

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.reader_shutdown.lock().await = Some(shutdown_tx);

        let backend_name = self.name.clone();
        let base_url = url.clone();
        let pending = Arc::clone(&self.pending);
        let mut endpoint_tx = Some(endpoint_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = events.next() => {
                        let Some(event) = next else { break };
                        let event = match event {
                            Ok(e) => e,
                            Err(e) => {
                                warn!(backend = %backend_name, error = %e, "SSE stream error");
                                break;
                            }
                        };
                        let Some(data) = event.data else { continue };

                        if event.event.as_deref() == Some("endpoint") {
                            let resolved = if data.starts_with("http://") || data.starts_with("https://") {
                                data
                            } else {
                                match reqwest::Url::parse(&base_url).and_then(|base| base.join(&data)) {
                                    Ok(joined) => joined.to_string(),
                                    Err(_) => data,
                                }
                            };
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(resolved);
                            }
                            continue;
                        }

                        let Ok(parsed) = serde_json::from_str::<Value>(&data) else { continue };
                        let Some(id) = parsed.get("id").and_then(Value::as_u64) else { continue };
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(parsed);
                        }
                    }
                }
            }
            debug!(backend = %backend_name, "SSE reader task exiting");
        });

        let endpoint = tokio::time::timeout(self.startup_timeout, endpoint_rx)
            .await
            .with_context(|| format!("SSE backend '{}' never announced its endpoint", self.name))?
            .context("SSE endpoint channel closed")?;
        *self.post_url.lock().await = Some(endpoint);

        let init_result = self
            .send_request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "mcp-bridge-gateway", "version": env!("CARGO_PKG_VERSION")},
                }),
                self.startup_timeout,
            )
            .await?;
        if init_result.get("error").is_some() {
            anyhow::bail!("SSE backend '{}' rejected initialize: {init_result}", self.name);
        }
        info!(backend = %self.name, "sse handshake complete");
        Ok(())
    }

    async fn list_capabilities(&self, kind: CapabilityKind) -> Result<Vec<DiscoveredCapability>> {
        let method = match kind {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        };
        let result = self.send_request(method, json!({}), self.startup_timeout).await?;
        let items = result
            .get("result")
            .and_then(|r| match kind {
                CapabilityKind::Tool => r.get("tools"),
                CapabilityKind::Resource => r.get("resources"),
                CapabilityKind::Prompt => r.get("prompts"),
            })
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(items
            .into_iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?.to_string();
                Some(DiscoveredCapability {
                    kind,
                    original_name: name,
                    description: item.get("description").and_then(Value::as_str).map(String::from),
                    schema: item.get("inputSchema").cloned(),
                })
            })
            .collect())
    }

    async fn call(
        &self,
        kind: CapabilityKind,
        name: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let (method, params) = match kind {
            CapabilityKind::Tool => (
                "tools/call",
                json!({"name": name, "arguments": arguments.unwrap_or(json!({}))}),
            ),
            CapabilityKind::Resource => ("resources/read", json!({"uri": name})),
            CapabilityKind::Prompt => (
                "prompts/get",
                json!({"name": name, "arguments": arguments.unwrap_or(json!({}))}),
            ),
        };
        let response = self.send_request(method, params, deadline).await?;
        if let Some(error) = response.get("error") {
            anyhow::bail!("backend '{}' returned error: {error}", self.name);
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.send_request("ping", json!({}), self.startup_timeout).await?;
        Ok(start.elapsed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(tx) = self.reader_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        info!(backend = %self.name, "sse backend stopped");
        Ok(())
    }
}
