//! The routing terminal: the innermost step of the middleware chain.
//! Resolves an exposed capability name against the currently published
//! route map and forwards the call to the owning backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::client_manager::ClientManager;
use crate::error::GatewayError;
use crate::registry::RouteRegistry;
use crate::session::CapabilityKind;

const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(60);

/// Everything the routing terminal needs, handed to it by whoever wires
/// up the middleware chain (`main`, in the end).
pub struct Router {
    registry: Arc<RouteRegistry>,
    backends: Arc<ClientManager>,
}

impl Router {
    pub fn new(registry: Arc<RouteRegistry>, backends: Arc<ClientManager>) -> Self {
        Self { registry, backends }
    }

    /// Resolve `name` against the published route map and dispatch to
    /// the owning backend, translating the lookup and call failures into
    /// the gateway's error taxonomy.
    pub async fn route(&self, kind: CapabilityKind, name: &str, arguments: Option<Value>) -> Result<Value, GatewayError> {
        let snapshot = self.registry.snapshot();
        let entry = snapshot
            .resolve(kind, name)
            .ok_or_else(|| GatewayError::CapabilityNotFound { name: name.to_string() })?
            .clone();

        self.backends
            .call(&entry.backend, kind, &entry.original_name, arguments, DEFAULT_CALL_DEADLINE)
            .await
            .map_err(|e| classify_call_error(&entry.backend, e))
    }

    /// Resolve a name without dispatching, for middleware (authorization)
    /// that needs to know which backend owns a capability before the
    /// call itself happens.
    pub fn resolve_backend(&self, kind: CapabilityKind, name: &str) -> Option<String> {
        self.registry.snapshot().resolve(kind, name).map(|e| e.backend.clone())
    }
}

fn classify_call_error(backend: &str, error: anyhow::Error) -> GatewayError {
    let message = error.to_string();
    if message.contains("not accepting calls") {
        GatewayError::BackendUnavailable { backend: backend.to_string() }
    } else if message.contains("timed out") {
        GatewayError::Timeout { elapsed: DEFAULT_CALL_DEADLINE }
    } else if message.contains("semaphore closed") {
        GatewayError::BackendOverloaded { backend: backend.to_string() }
    } else {
        GatewayError::TransportFailure { backend: backend.to_string(), detail: message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_capability_is_reported_as_not_found() {
        let registry = RouteRegistry::new();
        let backends = ClientManager::new();
        let router = Router::new(registry, backends);

        let err = router.route(CapabilityKind::Tool, "missing", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::CapabilityNotFound { .. }));
    }

    #[test]
    fn resolve_backend_returns_none_for_unknown_name() {
        let registry = RouteRegistry::new();
        let backends = ClientManager::new();
        let router = Router::new(registry, backends);
        assert!(router.resolve_backend(CapabilityKind::Tool, "missing").is_none());
    }
}
