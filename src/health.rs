//! Background health checker.
//!
//! Runs one staggered probe loop per backend, pinging it on
//! `health.interval` and folding consecutive failures/slow responses into
//! `Ready -> Degraded -> Failed` transitions (and back, once probes
//! recover). The route map is never touched directly here — whoever owns
//! the reload coordinator re-derives it from `ClientManager::status_all`
//! after a phase change.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client_manager::{BackendPhase, ClientManager};
use crate::config::HealthConfig;
use crate::reload::ReloadCoordinator;

struct ProbeCounters {
    consecutive_failures: u32,
    consecutive_slow: u32,
}

impl ProbeCounters {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_slow: 0,
        }
    }
}

/// Owns one background task per configured backend.
pub struct HealthChecker {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    /// Spawn a probe loop for every backend currently known to `manager`.
    /// Each loop starts at a random offset within one interval so a large
    /// fleet doesn't all probe in the same tick. `reload` is used to
    /// rebuild the route map whenever a probe moves a backend across the
    /// accepts-calls boundary.
    pub fn spawn(manager: Arc<ClientManager>, config: HealthConfig, reload: Arc<ReloadCoordinator>) -> Self {
        let names = manager.configured_names();
        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            let manager = Arc::clone(&manager);
            let config = config.clone();
            let reload = Arc::clone(&reload);
            tasks.push(tokio::spawn(async move {
                probe_loop(manager, name, config, reload).await;
            }));
        }
        Self { tasks }
    }

    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn probe_loop(manager: Arc<ClientManager>, name: String, config: HealthConfig, reload: Arc<ReloadCoordinator>) {
    let interval_ms = config.interval.as_millis().max(1) as u64;
    let jitter = stagger_offset(&name, interval_ms);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let mut counters = ProbeCounters::new();
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;

        let Some(phase) = manager.phase(&name).await else {
            debug!(backend = %name, "health probe stopping: backend no longer configured");
            return;
        };
        if matches!(phase, BackendPhase::ShuttingDown | BackendPhase::Pending | BackendPhase::Initializing) {
            continue;
        }

        let outcome = tokio::time::timeout(config.timeout, manager.ping(&name)).await;
        match outcome {
            Ok(Ok(latency)) => {
                counters.consecutive_failures = 0;
                if latency > config.latency_threshold {
                    counters.consecutive_slow += 1;
                } else {
                    counters.consecutive_slow = 0;
                }
                apply_transition(&manager, &name, phase, &counters, &config, &reload).await;
            }
            Ok(Err(e)) => {
                counters.consecutive_failures += 1;
                counters.consecutive_slow = 0;
                warn!(backend = %name, error = %e, failures = counters.consecutive_failures, "health probe failed");
                apply_transition(&manager, &name, phase, &counters, &config, &reload).await;
            }
            Err(_) => {
                counters.consecutive_failures += 1;
                counters.consecutive_slow = 0;
                warn!(backend = %name, failures = counters.consecutive_failures, "health probe timed out");
                apply_transition(&manager, &name, phase, &counters, &config, &reload).await;
            }
        }
    }
}

async fn apply_transition(
    manager: &Arc<ClientManager>,
    name: &str,
    current: BackendPhase,
    counters: &ProbeCounters,
    config: &HealthConfig,
    reload: &Arc<ReloadCoordinator>,
) {
    let next = next_phase(current, counters, config);
    if next != current {
        info!(backend = %name, from = ?current, to = ?next, "backend health transition");
        manager.set_phase(name, next).await;
        if let Err(e) = reload.on_backend_transition(name, current, next).await {
            warn!(backend = %name, error = %e, "failed to republish route map after health transition");
        }
    }
}

fn next_phase(current: BackendPhase, counters: &ProbeCounters, config: &HealthConfig) -> BackendPhase {
    if !matches!(current, BackendPhase::Ready | BackendPhase::Degraded) {
        return current;
    }

    if counters.consecutive_failures >= config.failed_threshold {
        return BackendPhase::Failed;
    }
    if counters.consecutive_failures >= config.degraded_threshold || counters.consecutive_slow >= config.slow_threshold {
        return BackendPhase::Degraded;
    }
    BackendPhase::Ready
}

/// Deterministic spread of probe start times across one interval so a
/// large fleet doesn't all probe in the same tick.
fn stagger_offset(backend_name: &str, interval_ms: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    backend_name.hash(&mut hasher);
    hasher.finish() % interval_ms
}

/// Snapshot of probe state exposed for diagnostics, keyed by backend name.
pub async fn summarize(manager: &ClientManager) -> HashMap<String, BackendPhase> {
    let mut out = HashMap::new();
    for name in manager.configured_names() {
        let phase = manager.phase(&name).await.unwrap_or(BackendPhase::Pending);
        out.insert(name, phase);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(failures: u32, slow: u32) -> ProbeCounters {
        ProbeCounters {
            consecutive_failures: failures,
            consecutive_slow: slow,
        }
    }

    #[test]
    fn healthy_probes_stay_ready() {
        let config = HealthConfig::default();
        assert_eq!(next_phase(BackendPhase::Ready, &counters(0, 0), &config), BackendPhase::Ready);
    }

    #[test]
    fn failures_past_degraded_threshold_degrade() {
        let config = HealthConfig::default();
        assert_eq!(
            next_phase(BackendPhase::Ready, &counters(config.degraded_threshold, 0), &config),
            BackendPhase::Degraded
        );
    }

    #[test]
    fn failures_past_failed_threshold_fail() {
        let config = HealthConfig::default();
        assert_eq!(
            next_phase(BackendPhase::Degraded, &counters(config.failed_threshold, 0), &config),
            BackendPhase::Failed
        );
    }

    #[test]
    fn slow_streak_degrades_without_hard_failures() {
        let config = HealthConfig::default();
        assert_eq!(
            next_phase(BackendPhase::Ready, &counters(0, config.slow_threshold), &config),
            BackendPhase::Degraded
        );
    }

    #[test]
    fn failed_backends_are_left_alone_by_the_prober() {
        let config = HealthConfig::default();
        assert_eq!(next_phase(BackendPhase::Failed, &counters(0, 0), &config), BackendPhase::Failed);
    }
}
