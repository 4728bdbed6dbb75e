//! Audit trail: one record per routed call, independent of the operator
//! log. Every event lands in a bounded in-memory ring (oldest dropped
//! first once `queue_depth` is reached) that backs the admin `/events`
//! endpoint, and is mirrored to a size-rotated NDJSON file on disk by a
//! background task.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::error;

use crate::auth::Identity;
use crate::config::AuditConfig;
use crate::session::CapabilityKind;

/// How a routed call was resolved, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
    Cancelled,
}

/// What kind of thing an audit record describes. Distinct from
/// `AuditEvent::kind` (the target `CapabilityKind`, when there is one) —
/// this is what lets a denial and a completed call be told apart without
/// inspecting `outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    McpOperation,
    CapabilityDropped,
    BackendTransition,
    AuthFailure,
    Reload,
}

/// One audit record. `id` is monotonic within a process lifetime and is
/// what the admin `/api/v1/events?since=` cursor is relative to.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event_kind: AuditEventKind,
    pub subject: String,
    pub roles: Vec<String>,
    pub backend: Option<String>,
    pub kind: Option<CapabilityKind>,
    pub name: String,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

struct Inner {
    config: AuditConfig,
    ring: Mutex<VecDeque<AuditEvent>>,
    pending_write: Mutex<VecDeque<AuditEvent>>,
    notify: Notify,
    next_id: AtomicU64,
}

/// Records and persists audit events. Cheap to clone — it's a thin
/// handle over an `Arc`.
#[derive(Clone)]
pub struct AuditRecorder {
    inner: Arc<Inner>,
}

impl AuditRecorder {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ring: Mutex::new(VecDeque::new()),
                pending_write: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn the background task that drains pending events to disk.
    /// A no-op (returns `None`) when auditing is disabled in config.
    pub fn spawn_writer(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enabled {
            return None;
        }
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move { writer_loop(inner).await }))
    }

    /// Record one audit event, building it from the pieces a middleware
    /// has on hand at the end of a call.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        event_kind: AuditEventKind,
        identity: &Identity,
        backend: Option<&str>,
        kind: Option<CapabilityKind>,
        name: &str,
        outcome: AuditOutcome,
        duration: Duration,
        detail: Option<String>,
    ) {
        let event = AuditEvent {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event_kind,
            subject: identity.subject.clone(),
            roles: identity.roles.clone(),
            backend: backend.map(String::from),
            kind,
            name: name.to_string(),
            outcome,
            duration_ms: duration.as_millis() as u64,
            detail,
        };

        {
            let mut ring = self.inner.ring.lock().await;
            push_bounded(&mut ring, event.clone(), self.inner.config.queue_depth);
        }
        if self.inner.config.enabled {
            let mut pending = self.inner.pending_write.lock().await;
            push_bounded(&mut pending, event, self.inner.config.queue_depth);
            self.inner.notify.notify_one();
        }
    }

    /// Events with `id > since`, oldest first, capped at `max`.
    pub async fn events_since(&self, since: u64, max: usize) -> Vec<AuditEvent> {
        let ring = self.inner.ring.lock().await;
        ring.iter().filter(|e| e.id > since).take(max).cloned().collect()
    }
}

fn push_bounded(buffer: &mut VecDeque<AuditEvent>, event: AuditEvent, capacity: usize) {
    if buffer.len() >= capacity.max(1) {
        buffer.pop_front();
    }
    buffer.push_back(event);
}

async fn writer_loop(inner: Arc<Inner>) {
    loop {
        inner.notify.notified().await;
        let batch: Vec<AuditEvent> = {
            let mut pending = inner.pending_write.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            continue;
        }
        if let Err(e) = append_and_rotate(&inner.config, &batch).await {
            error!(error = %e, "failed to persist audit events");
        }
    }
}

async fn append_and_rotate(config: &AuditConfig, batch: &[AuditEvent]) -> anyhow::Result<()> {
    let path = PathBuf::from(&config.file);
    let max_size = config.max_size;
    let backup_count = config.backup_count;
    let lines: Vec<String> = batch.iter().map(|e| serde_json::to_string(e)).collect::<Result<_, _>>()?;

    tokio::task::spawn_blocking(move || write_lines_blocking(&path, &lines, max_size, backup_count))
        .await
        .map_err(|e| anyhow::anyhow!("audit writer task panicked: {e}"))?
}

fn write_lines_blocking(path: &Path, lines: &[String], max_size: u64, backup_count: u32) -> anyhow::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() && path.metadata()?.len() >= max_size {
        rotate(path, backup_count)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

fn rotate(path: &Path, backup_count: u32) -> anyhow::Result<()> {
    if backup_count == 0 {
        std::fs::remove_file(path).ok();
        return Ok(());
    }
    let oldest = path.with_extension(format!("{backup_count}.jsonl"));
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..backup_count).rev() {
        let from = path.with_extension(format!("{n}.jsonl"));
        if from.exists() {
            let to = path.with_extension(format!("{}.jsonl", n + 1));
            std::fs::rename(from, to)?;
        }
    }
    let first_backup = path.with_extension("1.jsonl");
    std::fs::rename(path, first_backup)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> AuditConfig {
        AuditConfig {
            enabled: true,
            file: dir.join("audit.jsonl").to_string_lossy().to_string(),
            max_size: 1024,
            backup_count: 2,
            queue_depth: 10,
        }
    }

    fn identity() -> Identity {
        Identity {
            subject: "alice".to_string(),
            roles: vec!["operator".to_string()],
            email: None,
            display_name: None,
            provider: "local".to_string(),
            claims: Default::default(),
        }
    }

    #[tokio::test]
    async fn recorded_events_are_retrievable_by_id() {
        let recorder = AuditRecorder::new(config(tempdir().unwrap().path()));
        recorder
            .record(
                AuditEventKind::McpOperation,
                &identity(),
                Some("exa"),
                Some(CapabilityKind::Tool),
                "search",
                AuditOutcome::Success,
                Duration::from_millis(12),
                None,
            )
            .await;
        recorder
            .record(
                AuditEventKind::AuthFailure,
                &identity(),
                Some("exa"),
                Some(CapabilityKind::Tool),
                "fetch",
                AuditOutcome::Denied,
                Duration::from_millis(1),
                Some("no role".into()),
            )
            .await;

        let events = recorder.events_since(0, 10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "search");
        assert_eq!(events[1].outcome, AuditOutcome::Denied);
        assert_eq!(events[1].event_kind, AuditEventKind::AuthFailure);
    }

    #[tokio::test]
    async fn since_cursor_excludes_already_seen_events() {
        let recorder = AuditRecorder::new(config(tempdir().unwrap().path()));
        recorder
            .record(AuditEventKind::McpOperation, &identity(), None, Some(CapabilityKind::Tool), "a", AuditOutcome::Success, Duration::ZERO, None)
            .await;
        recorder
            .record(AuditEventKind::McpOperation, &identity(), None, Some(CapabilityKind::Tool), "b", AuditOutcome::Success, Duration::ZERO, None)
            .await;

        let first_id = recorder.events_since(0, 10).await[0].id;
        let events = recorder.events_since(first_id, 10).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "b");
    }

    #[tokio::test]
    async fn ring_drops_oldest_past_queue_depth() {
        let mut cfg = config(tempdir().unwrap().path());
        cfg.queue_depth = 2;
        let recorder = AuditRecorder::new(cfg);
        for name in ["a", "b", "c"] {
            recorder
                .record(AuditEventKind::McpOperation, &identity(), None, Some(CapabilityKind::Tool), name, AuditOutcome::Success, Duration::ZERO, None)
                .await;
        }
        let events = recorder.events_since(0, 10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "b");
        assert_eq!(events[1].name, "c");
    }

    #[tokio::test]
    async fn writer_persists_events_to_rotating_file() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let file_path = cfg.file.clone();
        let recorder = AuditRecorder::new(cfg);
        let handle = recorder.spawn_writer().unwrap();

        recorder
            .record(
                AuditEventKind::McpOperation,
                &identity(),
                Some("exa"),
                Some(CapabilityKind::Tool),
                "search",
                AuditOutcome::Success,
                Duration::from_millis(5),
                None,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let contents = std::fs::read_to_string(&file_path).unwrap();
        assert!(contents.contains("\"search\""));
    }
}
