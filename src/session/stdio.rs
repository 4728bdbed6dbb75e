//! Stdio backend session: spawns the backend as a child process and
//! speaks MCP over its stdin/stdout pipes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{ServiceExt, model::*, service::RunningService};
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BackendSession, CapabilityKind, DiscoveredCapability, map_call_tool_result, map_tools_to_capabilities};
use crate::config::BackendConfig;

/// A stdio child-process MCP backend.
///
/// The child is spawned directly (rather than handed to rmcp to manage)
/// so the session retains the `Child` handle for instant crash detection
/// via `wait_for_exit` and for process-group teardown on stop.
pub struct StdioSession {
    name: String,
    config: BackendConfig,
    init_timeout: Duration,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<tokio::process::Child>>,
}

impl StdioSession {
    pub fn new(name: String, config: BackendConfig, init_timeout: Duration) -> Self {
        Self {
            name,
            config,
            init_timeout,
            service: RwLock::new(None),
            child: RwLock::new(None),
        }
    }

    fn build_command(&self) -> Result<Command> {
        let connect = &self.config.connect;
        let cmd_str = connect
            .command
            .as_deref()
            .context("stdio backend missing connect.command")?;
        let mut cmd = Command::new(cmd_str);
        if !connect.args.is_empty() {
            cmd.args(&connect.args);
        }
        for (key, value) in &connect.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &connect.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    /// Kill the child's entire process group (unix). Falls back to
    /// killing just the child elsewhere or if the PID is unavailable.
    async fn kill_child(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(backend = %self.name, pid, "sent SIGTERM to process group");
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                warn!(backend = %self.name, pid, "failed to signal process group, killing child directly");
            }
        }
        let _ = child.kill().await;
    }

    /// Wait for the child process to exit. Used by the reaper task to
    /// detect a crashed backend without waiting for the next health probe.
    pub async fn wait_for_exit(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.write().await;
        if let Some(child) = guard.as_mut() {
            child.wait().await.ok()
        } else {
            None
        }
    }
}

/// Line-buffer the child's stderr and forward it to the operator log,
/// prefixed with the backend name, instead of discarding it.
fn spawn_stderr_forwarder(backend_name: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        info!(backend = %backend_name, stderr = %line, "backend stderr");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(backend = %backend_name, error = %e, "error reading backend stderr");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl BackendSession for StdioSession {
    async fn initialize(&self) -> Result<()> {
        let mut cmd = self.build_command()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn backend '{}'", self.name))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .context("failed to capture stdout from backend")?;
        let stdin = child
            .stdin
            .take()
            .context("failed to capture stdin from backend")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to capture stderr from backend")?;
        spawn_stderr_forwarder(self.name.clone(), stderr);

        let service = tokio::time::timeout(self.init_timeout, ().serve((stdout, stdin)))
            .await
            .with_context(|| format!("MCP handshake with backend '{}' timed out", self.name))?
            .with_context(|| format!("failed MCP handshake with backend '{}'", self.name))?;

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                pid = ?pid,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "stdio handshake complete"
            );
        }

        *self.service.write().await = Some(service);
        *self.child.write().await = Some(child);
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
            // Resources and prompts follow the same rmcp pagination shape;
            // left for a follow-on backend that actually exposes them.
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
                let result = tokio::time::timeout(deadline, service.call_tool(params))
                    .await
                    .with_context(|| format!("tool call '{name}' timed out after {deadline:?}"))?
                    .with_context(|| format!("tool call '{name}' failed"))?;
                Ok(map_call_tool_result(result))
            }
            CapabilityKind::Resource | CapabilityKind::Prompt => {
                anyhow::bail!("stdio backend '{}' does not support {:?} yet", self.name, kind)
            }
        }
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.list_capabilities(CapabilityKind::Tool).await?;
        Ok(start.elapsed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            warn!(backend = %self.name, error = %e, "error cancelling service");
        }
        if let Some(mut child) = self.child.write().await.take() {
            self.kill_child(&mut child).await;
        }
        info!(backend = %self.name, "stdio backend stopped");
        Ok(())
    }
}
