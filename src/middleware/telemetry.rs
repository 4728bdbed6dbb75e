//! Request-scoped logging: one structured span per routed call, entered
//! for the duration of authorization + dispatch so every log line inside
//! carries the subject, capability, and backend without repeating them.

use std::time::Instant;

use tracing::Span;

use crate::auth::Identity;
use crate::session::CapabilityKind;

pub struct CallTelemetry {
    pub span: Span,
    pub started_at: Instant,
}

pub fn start(identity: &Identity, kind: CapabilityKind, name: &str) -> CallTelemetry {
    let span = tracing::info_span!(
        "mcp_call",
        subject = %identity.subject,
        kind = ?kind,
        capability = %name,
    );
    CallTelemetry {
        span,
        started_at: Instant::now(),
    }
}

impl CallTelemetry {
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
