//! Tracks upstream MCP client sessions.
//!
//! Each upstream client that completes an `initialize` handshake gets a
//! session id and a frozen route-map snapshot: the set of capabilities
//! it was told about at connect time, which it keeps using even if a
//! reload republishes a different map in the background, until the
//! session itself re-initializes or expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::SessionTrackerConfig;
use crate::registry::RouteMap;

struct TrackedSession {
    snapshot: Arc<RouteMap>,
    last_seen: std::sync::Mutex<Instant>,
}

/// Live upstream client sessions, keyed by session id.
pub struct SessionTracker {
    sessions: DashMap<Uuid, TrackedSession>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(config: &SessionTrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            ttl: config.ttl,
        })
    }

    /// Register a newly initialized session, freezing `snapshot` as what
    /// that session will keep seeing until it re-initializes.
    pub fn open(&self, snapshot: Arc<RouteMap>) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            TrackedSession {
                snapshot,
                last_seen: std::sync::Mutex::new(Instant::now()),
            },
        );
        id
    }

    /// The route map snapshot a session should keep resolving calls
    /// against, refreshing its last-seen time as a side effect.
    pub fn snapshot_for(&self, id: Uuid) -> Option<Arc<RouteMap>> {
        let entry = self.sessions.get(&id)?;
        *entry.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Some(Arc::clone(&entry.snapshot))
    }

    pub fn close(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session whose last activity is older than `ttl`.
    /// Returns the number of sessions swept.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| {
                let last_seen = *entry.value().last_seen.lock().unwrap_or_else(|e| e.into_inner());
                last_seen.elapsed() > ttl
            })
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired.len()
    }

    /// Spawn the periodic sweep loop; abort the returned handle to stop it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = tracker.sweep();
                if swept > 0 {
                    tracing::debug!(count = swept, "swept expired upstream sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::AttributedCapability;

    fn empty_snapshot() -> Arc<RouteMap> {
        Arc::new(RouteMap::build(Vec::<AttributedCapability>::new()))
    }

    #[test]
    fn open_and_snapshot_for_round_trips() {
        let tracker = SessionTracker::new(&SessionTrackerConfig::default());
        let id = tracker.open(empty_snapshot());
        assert!(tracker.snapshot_for(id).is_some());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn closing_removes_the_session() {
        let tracker = SessionTracker::new(&SessionTrackerConfig::default());
        let id = tracker.open(empty_snapshot());
        tracker.close(id);
        assert!(tracker.snapshot_for(id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn unknown_session_id_resolves_to_nothing() {
        let tracker = SessionTracker::new(&SessionTrackerConfig::default());
        assert!(tracker.snapshot_for(Uuid::new_v4()).is_none());
    }

    #[test]
    fn sweep_drops_sessions_past_ttl() {
        let tracker = SessionTracker::new(&SessionTrackerConfig {
            ttl: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
        });
        tracker.open(empty_snapshot());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.sweep(), 1);
        assert!(tracker.is_empty());
    }
}
