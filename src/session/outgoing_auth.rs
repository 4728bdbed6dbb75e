//! Outgoing authentication strategies used when the gateway itself
//! talks to a backend: a fixed header set, or an OAuth2 client-credentials
//! token fetch with single-flight refresh so N concurrent callers hitting
//! an expired token trigger exactly one refresh request.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::OutgoingAuth;

/// Resolves the headers to attach to a backend request under the
/// backend's configured outgoing-auth strategy.
pub enum AuthHeaders {
    None,
    Static(Vec<(String, String)>),
    ClientCredentials(Arc<ClientCredentialsAuth>),
}

impl AuthHeaders {
    pub fn from_config(config: &OutgoingAuth, http_client: reqwest::Client) -> Self {
        match config {
            OutgoingAuth::None => AuthHeaders::None,
            OutgoingAuth::Static { headers } => {
                AuthHeaders::Static(headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            OutgoingAuth::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
                refresh_buffer,
            } => AuthHeaders::ClientCredentials(Arc::new(ClientCredentialsAuth::new(
                http_client,
                token_url.clone(),
                client_id.clone(),
                client_secret.clone(),
                scopes.clone(),
                *refresh_buffer,
            ))),
        }
    }

    /// Resolve headers to apply for the next outgoing request. Errors if
    /// a client-credentials token fetch fails.
    pub async fn resolve(&self) -> Result<Vec<(String, String)>> {
        match self {
            AuthHeaders::None => Ok(Vec::new()),
            AuthHeaders::Static(headers) => Ok(headers.clone()),
            AuthHeaders::ClientCredentials(auth) => {
                let token = auth.token().await?;
                Ok(vec![("Authorization".to_string(), format!("Bearer {token}"))])
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// OAuth2 client-credentials grant with a cached token and single-flight
/// refresh: the `Mutex` both guards the cache and serializes refreshes,
/// so concurrent callers racing an expired token share one HTTP round trip.
pub struct ClientCredentialsAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    refresh_buffer: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsAuth {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
            scopes,
            refresh_buffer,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref()
            && Instant::now() + self.refresh_buffer < cached.expires_at
        {
            return Ok(cached.access_token.clone());
        }

        debug!(token_url = %self.token_url, "fetching client-credentials token");
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let scope_str = self.scopes.join(" ");
        if !self.scopes.is_empty() {
            form.push(("scope", scope_str.as_str()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .context("client-credentials token request failed")?
            .error_for_status()
            .context("client-credentials token endpoint returned an error status")?;

        let parsed: TokenResponse = response
            .json()
            .await
            .context("client-credentials token response was not valid JSON")?;

        let expires_at = Instant::now() + Duration::from_secs(parsed.expires_in);
        let token = parsed.access_token.clone();
        *guard = Some(CachedToken {
            access_token: parsed.access_token,
            expires_at,
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_headers_pass_through() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("X-Api-Key".to_string(), "secret".to_string());
        let auth = AuthHeaders::from_config(&OutgoingAuth::Static { headers }, reqwest::Client::new());
        assert!(matches!(auth, AuthHeaders::Static(_)));
    }

    #[tokio::test]
    async fn none_resolves_to_empty() {
        let auth = AuthHeaders::from_config(&OutgoingAuth::None, reqwest::Client::new());
        assert!(auth.resolve().await.unwrap().is_empty());
    }
}
