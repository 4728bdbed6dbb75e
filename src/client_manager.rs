//! Owns the lifecycle of every backend connection: the
//! `Pending -> Initializing -> Ready -> [Degraded] -> Failed -> ShuttingDown`
//! state machine, construction of the right `BackendSession` for a
//! backend's transport, and the per-backend call concurrency cap.
//!
//! Backend state lives here; the route map (`registry`) only ever holds
//! what's currently exposed, never a backend handle. The two are kept in
//! sync by whoever drives `ClientManager` (the reload coordinator and
//! `main`), never by `ClientManager` reaching into the registry itself.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{error, info, warn};

use crate::config::{BackendConfig, Config, Transport};
use crate::session::sse::SseSession;
use crate::session::stdio::StdioSession;
use crate::session::streamable_http::StreamableHttpSession;
use crate::session::{BackendSession, CapabilityKind, DiscoveredCapability};

const DEFAULT_CALL_CONCURRENCY: usize = 64;
const DEFAULT_CAP_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SSE_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle phase of one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPhase {
    Pending,
    Initializing,
    Ready,
    Degraded,
    Failed,
    ShuttingDown,
}

impl BackendPhase {
    /// Whether calls may be dispatched to a backend in this phase.
    pub fn accepts_calls(self) -> bool {
        matches!(self, BackendPhase::Ready | BackendPhase::Degraded)
    }
}

struct ManagedBackend {
    name: String,
    config: BackendConfig,
    session: RwLock<Option<Arc<dyn BackendSession>>>,
    phase: RwLock<BackendPhase>,
    /// Serializes start/stop/restart for this one backend so concurrent
    /// reload and health-driven restarts can't race each other.
    transition_lock: Mutex<()>,
    call_permits: Semaphore,
    in_flight: AtomicUsize,
    /// Bumped every time a restart under `transition_lock` completes.
    /// Lets a caller that just blocked on the lock tell whether a
    /// concurrent reconnect already did its work.
    generation: AtomicU64,
}

impl ManagedBackend {
    fn new(name: String, config: BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            call_permits: Semaphore::new(DEFAULT_CALL_CONCURRENCY),
            config,
            session: RwLock::new(None),
            phase: RwLock::new(BackendPhase::Pending),
            transition_lock: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        })
    }

    async fn phase(&self) -> BackendPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: BackendPhase) {
        *self.phase.write().await = phase;
    }

    fn build_session(&self, init_timeout: Duration, sse_startup_timeout: Duration) -> Arc<dyn BackendSession> {
        match self.config.transport {
            Transport::Stdio => Arc::new(StdioSession::new(self.name.clone(), self.config.clone(), init_timeout)),
            Transport::StreamableHttp => {
                Arc::new(StreamableHttpSession::new(self.name.clone(), self.config.clone(), init_timeout))
            }
            Transport::Sse => Arc::new(SseSession::new(self.name.clone(), self.config.clone(), sse_startup_timeout)),
        }
    }
}

/// Point-in-time status of one backend, for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub phase: BackendPhase,
    pub in_flight: usize,
    pub group: String,
}

/// Drives every backend connection through its lifecycle.
pub struct ClientManager {
    backends: DashMap<String, Arc<ManagedBackend>>,
}

impl ClientManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
        })
    }

    /// Bring up every backend named in `config`, concurrently. Failures
    /// land the backend in `Failed` rather than aborting the whole batch.
    pub async fn start_all(self: &Arc<Self>, config: &Config) {
        let mut names: Vec<&String> = config.backends.keys().collect();
        names.sort();

        let mut join_set = tokio::task::JoinSet::new();
        for name in names {
            let backend_config = config.backends[name].clone();
            let name = name.clone();
            let manager = Arc::clone(self);
            join_set.spawn(async move {
                if let Err(e) = manager.add_backend(&name, backend_config).await {
                    error!(backend = %name, error = %e, "backend failed to start");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Add (or replace) one backend and drive it through
    /// `Pending -> Initializing -> Ready`/`Failed`.
    pub async fn add_backend(self: &Arc<Self>, name: &str, config: BackendConfig) -> Result<()> {
        if let Some((_, existing)) = self.backends.remove(name) {
            Self::teardown(&existing).await;
        }

        let backend = ManagedBackend::new(name.to_string(), config.clone());
        self.backends.insert(name.to_string(), Arc::clone(&backend));

        let _guard = backend.transition_lock.lock().await;
        backend.set_phase(BackendPhase::Initializing).await;

        let init_timeout = config.timeouts.init_or(DEFAULT_INIT_TIMEOUT);
        let sse_startup = config.timeouts.sse_startup_or(DEFAULT_SSE_STARTUP_TIMEOUT);
        let session = backend.build_session(init_timeout, sse_startup);

        match session.initialize().await {
            Ok(()) => {
                *backend.session.write().await = Some(session);
                backend.set_phase(BackendPhase::Ready).await;
                info!(backend = %name, "backend ready");
                Ok(())
            }
            Err(e) => {
                backend.set_phase(BackendPhase::Failed).await;
                warn!(backend = %name, error = %e, "backend initialization failed");
                Err(e)
            }
        }
    }

    /// Atomically restart an already-configured backend in place:
    /// `ShuttingDown`, close and discard the old session, then a fresh
    /// `Pending -> Initializing` cycle on the same `ManagedBackend` —
    /// never a remove-and-reinsert, so there is never a moment with two
    /// session objects for this name. Idempotent: concurrent callers for
    /// the same backend coalesce onto whichever restart is already
    /// holding the lock and share its resulting phase, rather than each
    /// tearing the backend down independently.
    pub async fn reconnect(&self, name: &str) -> Result<BackendPhase> {
        let backend = self.backends.get(name).map(|r| Arc::clone(r.value())).context("backend not found")?;

        let observed_generation = backend.generation.load(Ordering::SeqCst);
        let _guard = backend.transition_lock.lock().await;

        if backend.generation.load(Ordering::SeqCst) != observed_generation {
            // Another caller already completed a restart while we waited
            // for the lock; nothing left for us to do.
            return Ok(backend.phase().await);
        }

        backend.set_phase(BackendPhase::ShuttingDown).await;
        if let Some(session) = backend.session.write().await.take()
            && let Err(e) = session.close().await
        {
            warn!(backend = %name, error = %e, "error closing backend session during reconnect");
        }

        backend.set_phase(BackendPhase::Initializing).await;
        let init_timeout = backend.config.timeouts.init_or(DEFAULT_INIT_TIMEOUT);
        let sse_startup = backend.config.timeouts.sse_startup_or(DEFAULT_SSE_STARTUP_TIMEOUT);
        let session = backend.build_session(init_timeout, sse_startup);

        let phase = match session.initialize().await {
            Ok(()) => {
                *backend.session.write().await = Some(session);
                backend.set_phase(BackendPhase::Ready).await;
                info!(backend = %name, "backend reconnected");
                BackendPhase::Ready
            }
            Err(e) => {
                backend.set_phase(BackendPhase::Failed).await;
                warn!(backend = %name, error = %e, "backend reconnect failed");
                BackendPhase::Failed
            }
        };
        backend.generation.fetch_add(1, Ordering::SeqCst);
        Ok(phase)
    }

    /// Remove a backend, draining it through `ShuttingDown` first.
    pub async fn remove_backend(&self, name: &str) -> Result<()> {
        if let Some((_, backend)) = self.backends.remove(name) {
            Self::teardown(&backend).await;
        }
        Ok(())
    }

    async fn teardown(backend: &Arc<ManagedBackend>) {
        let _guard = backend.transition_lock.lock().await;
        backend.set_phase(BackendPhase::ShuttingDown).await;
        if let Some(session) = backend.session.write().await.take()
            && let Err(e) = session.close().await
        {
            warn!(backend = %backend.name, error = %e, "error closing backend session");
        }
    }

    /// Stop every backend, waiting briefly for in-flight calls to settle.
    pub async fn stop_all(&self) {
        let backends: Vec<Arc<ManagedBackend>> = self.backends.iter().map(|e| Arc::clone(e.value())).collect();
        self.backends.clear();

        let drain_start = std::time::Instant::now();
        loop {
            let total: usize = backends.iter().map(|b| b.in_flight.load(Ordering::SeqCst)).sum();
            if total == 0 || drain_start.elapsed() > Duration::from_secs(10) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut join_set = tokio::task::JoinSet::new();
        for backend in backends {
            join_set.spawn(async move {
                Self::teardown(&backend).await;
            });
        }
        while join_set.join_next().await.is_some() {}
        info!("all backends stopped");
    }

    /// Discover everything a specific backend currently advertises.
    pub async fn discover(&self, name: &str, kind: CapabilityKind) -> Result<Vec<DiscoveredCapability>> {
        let backend = self.backends.get(name).map(|r| Arc::clone(r.value())).context("backend not found")?;
        let guard = backend.session.read().await;
        let session = guard.as_ref().context("backend has no live session")?;
        let cap_fetch_timeout = backend.config.timeouts.cap_fetch_or(DEFAULT_CAP_FETCH_TIMEOUT);
        tokio::time::timeout(cap_fetch_timeout, session.list_capabilities(kind))
            .await
            .context("capability discovery timed out")?
    }

    /// Forward a call to a named backend, honoring its concurrency cap
    /// and deadline. Fails fast (no retry loop) for anything not
    /// currently `Ready`/`Degraded` — the route map is republished the
    /// moment a backend leaves those phases, so a caller reaching this
    /// point with a stale route already raced a state change.
    pub async fn call(
        &self,
        backend_name: &str,
        kind: CapabilityKind,
        original_name: &str,
        arguments: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value> {
        let backend = self
            .backends
            .get(backend_name)
            .map(|r| Arc::clone(r.value()))
            .context("backend not found")?;

        if !backend.phase().await.accepts_calls() {
            anyhow::bail!("backend '{backend_name}' is not accepting calls");
        }

        let permit = backend
            .call_permits
            .acquire()
            .await
            .context("backend call semaphore closed")?;
        backend.in_flight.fetch_add(1, Ordering::SeqCst);
        let _decrement = DecrementOnDrop(&backend.in_flight);

        let guard = backend.session.read().await;
        let session = guard.as_ref().context("backend has no live session")?;
        let result = session.call(kind, original_name, arguments, deadline).await;
        drop(permit);
        result
    }

    /// Lightweight liveness probe for the health checker.
    pub async fn ping(&self, name: &str) -> Result<Duration> {
        let backend = self.backends.get(name).map(|r| Arc::clone(r.value())).context("backend not found")?;
        let guard = backend.session.read().await;
        let session = guard.as_ref().context("backend has no live session")?;
        session.ping().await
    }

    pub async fn set_phase(&self, name: &str, phase: BackendPhase) {
        if let Some(backend) = self.backends.get(name) {
            backend.set_phase(phase).await;
        }
    }

    pub async fn phase(&self, name: &str) -> Option<BackendPhase> {
        match self.backends.get(name) {
            Some(b) => Some(b.phase().await),
            None => None,
        }
    }

    pub async fn status_all(&self) -> Vec<BackendStatus> {
        let mut out = Vec::new();
        for entry in self.backends.iter() {
            let backend = entry.value();
            out.push(BackendStatus {
                name: backend.name.clone(),
                phase: backend.phase().await,
                in_flight: backend.in_flight.load(Ordering::SeqCst),
                group: backend.config.group.clone(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn configured_names(&self) -> Vec<String> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }
}

struct DecrementOnDrop<'a>(&'a AtomicUsize);
impl Drop for DecrementOnDrop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_and_degraded_accept_calls() {
        assert!(BackendPhase::Ready.accepts_calls());
        assert!(BackendPhase::Degraded.accepts_calls());
        assert!(!BackendPhase::Pending.accepts_calls());
        assert!(!BackendPhase::Initializing.accepts_calls());
        assert!(!BackendPhase::Failed.accepts_calls());
        assert!(!BackendPhase::ShuttingDown.accepts_calls());
    }

    #[tokio::test]
    async fn unknown_backend_call_fails() {
        let manager = ClientManager::new();
        let result = manager
            .call("missing", CapabilityKind::Tool, "foo", None, Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_all_is_sorted_and_empty_initially() {
        let manager = ClientManager::new();
        assert!(manager.status_all().await.is_empty());
    }

    #[tokio::test]
    async fn reconnecting_an_unconfigured_backend_fails() {
        let manager = ClientManager::new();
        assert!(manager.reconnect("missing").await.is_err());
    }
}
