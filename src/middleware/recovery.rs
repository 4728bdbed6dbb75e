//! Outermost layer of the chain: catches a panic anywhere downstream and
//! turns it into an ordinary `GatewayError::Internal` instead of taking
//! the whole process down with it.

use std::future::Future;

use crate::error::GatewayError;

pub async fn guard<F>(fut: F) -> Result<serde_json::Value, GatewayError>
where
    F: Future<Output = Result<serde_json::Value, GatewayError>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_cancelled() => Err(GatewayError::Cancelled),
        Err(join_error) => Err(GatewayError::Internal(join_error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_panic_downstream_becomes_an_internal_error() {
        let result = guard(async { panic!("boom") }).await;
        assert!(matches!(result, Err(GatewayError::Internal(_))));
    }

    #[tokio::test]
    async fn a_normal_result_passes_through_unchanged() {
        let result = guard(async { Ok(serde_json::json!({"ok": true})) }).await;
        assert!(result.is_ok());
    }
}
