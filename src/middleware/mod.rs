//! The onion-style request chain every routed call passes through:
//! Recovery -> Authentication -> Authorization -> Telemetry -> Audit ->
//! Routing. Each layer only knows about the one inside it; `GatewayChain`
//! is just the thing that nests them in the right order.

pub mod recovery;
pub mod telemetry;

use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;

use crate::audit::{AuditEventKind, AuditOutcome, AuditRecorder};
use crate::auth::AuthProvider;
use crate::authz::Authorizer;
use crate::error::GatewayError;
use crate::routing::Router;
use crate::session::CapabilityKind;

/// Everything one incoming call needs to pass through the chain.
pub struct GatewayChain {
    auth: Arc<AuthProvider>,
    authz: Arc<Authorizer>,
    audit: AuditRecorder,
    router: Arc<Router>,
}

impl GatewayChain {
    pub fn new(auth: Arc<AuthProvider>, authz: Arc<Authorizer>, audit: AuditRecorder, router: Arc<Router>) -> Self {
        Self { auth, authz, audit, router }
    }

    /// Drive one call through the full chain. `credential` is the raw
    /// bearer token already stripped of its `Bearer ` prefix.
    pub async fn handle(
        &self,
        credential: Option<&str>,
        kind: CapabilityKind,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let auth = Arc::clone(&self.auth);
        let authz = Arc::clone(&self.authz);
        let audit = self.audit.clone();
        let router = Arc::clone(&self.router);
        let credential = credential.map(String::from);
        let name = name.to_string();

        recovery::guard(async move {
            let identity = auth.authenticate(credential.as_deref()).await?;

            if !authz.is_authorized(&identity, kind, &name) {
                audit
                    .record(
                        AuditEventKind::AuthFailure,
                        &identity,
                        None,
                        Some(kind),
                        &name,
                        AuditOutcome::Denied,
                        std::time::Duration::ZERO,
                        None,
                    )
                    .await;
                return Err(GatewayError::Forbidden { reason: format!("'{}' may not call {kind:?}:{name}", identity.subject) });
            }

            let telemetry = telemetry::start(&identity, kind, &name);
            let span = telemetry.span.clone();

            async move {
                let backend = router.resolve_backend(kind, &name);
                audit
                    .record(
                        AuditEventKind::McpOperation,
                        &identity,
                        backend.as_deref(),
                        Some(kind),
                        &name,
                        AuditOutcome::Success,
                        std::time::Duration::ZERO,
                        None,
                    )
                    .await;

                let result = router.route(kind, &name, arguments).await;
                let outcome = match &result {
                    Ok(_) => AuditOutcome::Success,
                    Err(e) if e.is_cancelled() => AuditOutcome::Cancelled,
                    Err(_) => AuditOutcome::Error,
                };
                let detail = result.as_ref().err().map(|e| e.to_string());
                audit
                    .record(
                        AuditEventKind::McpOperation,
                        &identity,
                        backend.as_deref(),
                        Some(kind),
                        &name,
                        outcome,
                        telemetry.elapsed(),
                        detail,
                    )
                    .await;

                result
            }
            .instrument(span)
            .await
        })
        .await
    }
}
