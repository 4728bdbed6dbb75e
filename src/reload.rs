//! Hot-reload coordinator: diffs the currently running config against a
//! newly loaded one, applies the delta to `ClientManager`, rebuilds and
//! republishes the route map, and swaps the live `Config` in for
//! whoever else reads it (the admin API's status endpoint, mainly).
//!
//! Only one reload runs at a time — a second caller blocks on the same
//! lock rather than racing the first. Per-backend start/stop is already
//! serialized inside `ClientManager`; this layer's lock exists to make
//! "diff, then apply" atomic as a whole, not to protect any single field.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::{AuditEventKind, AuditOutcome, AuditRecorder};
use crate::auth::Identity;
use crate::client_manager::{BackendPhase, ClientManager};
use crate::config::Config;
use crate::conflict;
use crate::filter::{CompiledFilters, filter_and_rename};
use crate::registry::{RouteMap, RouteRegistry};
use crate::session::CapabilityKind;

const DEFAULT_RELOAD_DEADLINE: Duration = Duration::from_secs(30);

pub struct ReloadCoordinator {
    current: ArcSwap<Config>,
    lock: Mutex<()>,
    backends: Arc<ClientManager>,
    registry: Arc<RouteRegistry>,
    audit: AuditRecorder,
}

impl ReloadCoordinator {
    pub fn new(config: Config, backends: Arc<ClientManager>, registry: Arc<RouteRegistry>, audit: AuditRecorder) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(config),
            lock: Mutex::new(()),
            backends,
            registry,
            audit,
        })
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Apply `new_config`: start added backends, stop removed ones,
    /// restart changed ones, then rebuild and publish the route map.
    /// Bounded by `DEFAULT_RELOAD_DEADLINE` so a hung backend start
    /// can't wedge every future reload behind it.
    pub async fn reload(&self, new_config: Config) -> Result<()> {
        new_config.validate().context("new configuration failed validation")?;
        let _guard = self.lock.lock().await;

        let outcome = tokio::time::timeout(DEFAULT_RELOAD_DEADLINE, self.apply(new_config)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => bail!("reload timed out after {DEFAULT_RELOAD_DEADLINE:?}"),
        }
    }

    async fn apply(&self, new_config: Config) -> Result<()> {
        let old_config = self.current.load_full();
        let diff = old_config.diff_backends(&new_config);

        if diff.is_empty() {
            info!("reload: no backend changes, republishing route map only");
        } else {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                "applying backend diff"
            );
        }

        for name in &diff.removed {
            self.backends.remove_backend(name).await?;
        }
        for (name, config) in diff.added.into_iter().chain(diff.changed) {
            if let Err(e) = self.backends.add_backend(&name, config).await {
                warn!(backend = %name, error = %e, "backend failed to (re)start during reload");
            }
        }

        self.current.store(Arc::new(new_config.clone()));
        self.republish(&new_config).await?;
        Ok(())
    }

    /// Called by the health checker after it moves a backend to a new
    /// phase. Always records a `backend_transition` audit event; when the
    /// transition crosses the accepts-calls boundary (a backend leaving
    /// or rejoining `Ready`/`Degraded`), also rebuilds and republishes the
    /// route map so a `Failed` backend's capabilities disappear immediately
    /// instead of surviving until the next explicit reload.
    pub async fn on_backend_transition(&self, backend: &str, from: BackendPhase, to: BackendPhase) -> Result<()> {
        self.audit
            .record(
                AuditEventKind::BackendTransition,
                &Identity::anonymous(),
                Some(backend),
                None,
                backend,
                AuditOutcome::Success,
                Duration::ZERO,
                Some(format!("{from:?} -> {to:?}")),
            )
            .await;

        if from.accepts_calls() != to.accepts_calls() {
            let config = self.current.load_full();
            self.republish(&config).await?;
        }
        Ok(())
    }

    /// Rebuild the route map from every currently-Ready/Degraded
    /// backend's discovered capabilities and publish it atomically.
    pub async fn republish(&self, config: &Config) -> Result<()> {
        let mut attributed = Vec::new();
        for status in self.backends.status_all().await {
            if !status.phase.accepts_calls() {
                continue;
            }
            let Some(backend_config) = config.backends.get(&status.name) else { continue };
            let filters = CompiledFilters::compile(&backend_config.filters)?;

            for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
                let discovered = match self.backends.discover(&status.name, kind).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(backend = %status.name, error = %e, "capability discovery failed during republish");
                        continue;
                    }
                };
                let filtered = filter_and_rename(discovered, &filters, &backend_config.tool_overrides);
                attributed.extend(filtered.into_iter().map(|capability| conflict::AttributedCapability {
                    backend: status.name.clone(),
                    capability,
                }));
            }
        }

        let outcome = conflict::resolve(attributed, &config.conflict_resolution)?;
        for loser in &outcome.dropped {
            self.audit
                .record(
                    AuditEventKind::CapabilityDropped,
                    &Identity::anonymous(),
                    Some(&loser.backend),
                    Some(loser.kind),
                    &loser.name,
                    AuditOutcome::Success,
                    Duration::ZERO,
                    Some(format!("dropped by first-wins conflict resolution: '{}'", loser.name)),
                )
                .await;
        }
        self.registry.publish(RouteMap::build(outcome.resolved));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> Config {
        serde_yaml_ng::from_str("{}").unwrap()
    }

    fn audit() -> AuditRecorder {
        AuditRecorder::new(crate::config::AuditConfig {
            enabled: false,
            file: "audit.jsonl".to_string(),
            max_size: 1024,
            backup_count: 1,
            queue_depth: 16,
        })
    }

    #[tokio::test]
    async fn reload_with_no_backends_publishes_an_empty_route_map() {
        let backends = ClientManager::new();
        let registry = RouteRegistry::new();
        let coordinator = ReloadCoordinator::new(empty_config(), backends, registry.clone(), audit());

        coordinator.reload(empty_config()).await.unwrap();
        assert!(registry.snapshot().is_empty(CapabilityKind::Tool));
    }
}
