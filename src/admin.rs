//! Management REST API, gated behind the `admin` feature. Exposes
//! read-only status/capability/event views plus two operator actions:
//! triggering a reload and forcing one backend to reconnect.

#![cfg(feature = "admin")]

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use serde::{Deserialize, Serialize};

use crate::audit::AuditRecorder;
use crate::client_manager::{BackendPhase, ClientManager};
use crate::config::{AdminConfig, Config};
use crate::registry::RouteRegistry;
use crate::reload::ReloadCoordinator;
use crate::session::CapabilityKind;

#[derive(Clone)]
struct AdminState {
    backends: Arc<ClientManager>,
    registry: Arc<RouteRegistry>,
    reload: Arc<ReloadCoordinator>,
    audit: AuditRecorder,
}

pub fn router(backends: Arc<ClientManager>, registry: Arc<RouteRegistry>, reload: Arc<ReloadCoordinator>, audit: AuditRecorder) -> AxumRouter {
    let state = AdminState { backends, registry, reload, audit };
    AxumRouter::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/capabilities", get(get_capabilities))
        .route("/api/v1/events", get(get_events))
        .route("/api/v1/reload", post(post_reload))
        .route("/api/v1/backends/{name}/reconnect", post(post_reconnect))
        .with_state(state)
}

pub async fn serve(config: &AdminConfig, app: AxumRouter) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "admin API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct StatusResponse {
    backends: Vec<crate::client_manager::BackendStatus>,
    sessions: usize,
}

async fn get_status(State(state): State<AdminState>) -> impl IntoResponse {
    let backends = state.backends.status_all().await;
    Json(StatusResponse { backends, sessions: 0 })
}

#[derive(Serialize)]
struct CapabilityEntry {
    kind: CapabilityKind,
    exposed_name: String,
    backend: String,
    original_name: String,
}

async fn get_capabilities(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let mut out = Vec::new();
    for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
        for (name, entry) in snapshot.list(kind) {
            out.push(CapabilityEntry {
                kind,
                exposed_name: name.to_string(),
                backend: entry.backend.clone(),
                original_name: entry.original_name.clone(),
            });
        }
    }
    Json(out)
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: u64,
    #[serde(default = "default_max_events")]
    max: usize,
}

fn default_max_events() -> usize {
    100
}

async fn get_events(State(state): State<AdminState>, Query(query): Query<EventsQuery>) -> impl IntoResponse {
    Json(state.audit.events_since(query.since, query.max).await)
}

#[derive(Deserialize)]
struct ReloadRequest {
    config: Config,
}

async fn post_reload(State(state): State<AdminState>, body: Option<Json<ReloadRequest>>) -> impl IntoResponse {
    let Some(Json(request)) = body else {
        return (StatusCode::BAD_REQUEST, "missing reload request body").into_response();
    };
    match state.reload.reload(request.config).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Serialize)]
struct ReconnectReport {
    success: bool,
    phase: BackendPhase,
}

async fn post_reconnect(State(state): State<AdminState>, Path(name): Path<String>) -> impl IntoResponse {
    if !state.reload.current().backends.contains_key(&name) {
        return (StatusCode::NOT_FOUND, format!("backend '{name}' not configured")).into_response();
    }
    match restart_backend(&state, &name).await {
        Ok(phase) => Json(ReconnectReport { success: phase.accepts_calls(), phase }).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn restart_backend(state: &AdminState, name: &str) -> anyhow::Result<BackendPhase> {
    let phase = state.backends.reconnect(name).await?;
    state.reload.republish(&state.reload.current()).await?;
    Ok(phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_audit() -> AuditRecorder {
        AuditRecorder::new(crate::config::AuditConfig {
            enabled: false,
            file: "audit.jsonl".to_string(),
            max_size: 1024,
            backup_count: 1,
            queue_depth: 16,
        })
    }

    #[tokio::test]
    async fn status_reports_empty_fleet_with_no_backends() {
        let backends = ClientManager::new();
        let state = AdminState {
            backends: Arc::clone(&backends),
            registry: RouteRegistry::new(),
            reload: ReloadCoordinator::new(serde_yaml_ng::from_str("{}").unwrap(), backends, RouteRegistry::new(), test_audit()),
            audit: test_audit(),
        };
        let response = get_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn default_max_events_is_a_sane_page_size() {
        assert_eq!(default_max_events(), 100);
    }
}
