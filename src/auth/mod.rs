//! Incoming (upstream-client-facing) authentication.
//!
//! One `AuthProvider` per `incoming_auth` config variant, all reduced to
//! the same question: given the bearer credential presented with a
//! request, who is this and what roles do they carry? `Identity` is the
//! only thing that crosses into authorization — the provider-specific
//! detail (JWT claims, JWKS key id, ...) never leaks past this module.

mod jwks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;

use crate::config::IncomingAuthConfig;
use crate::error::GatewayError;
use jwks::JwksCache;

/// Who made this request, as far as the gateway is concerned.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub roles: Vec<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// Which `AuthProvider` variant produced this identity (`anonymous`,
    /// `local`, `jwt`).
    pub provider: String,
    /// The raw claim set the provider decoded, for policies or audit
    /// detail that need something `subject`/`roles` don't carry.
    pub claims: HashMap<String, Value>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            roles: vec!["anonymous".to_string()],
            email: None,
            display_name: None,
            provider: "anonymous".to_string(),
            claims: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayClaims {
    sub: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default, alias = "scope")]
    scopes: Option<String>,
    email: Option<String>,
    #[serde(default, alias = "name")]
    display_name: Option<String>,
    #[serde(flatten)]
    rest: HashMap<String, Value>,
}

/// Authenticates one incoming bearer credential per request.
pub enum AuthProvider {
    Anonymous,
    Local {
        token: String,
    },
    Jwt {
        jwks: Arc<JwksCache>,
        issuer: String,
        audience: String,
        allowed_algorithms: Vec<Algorithm>,
    },
}

impl AuthProvider {
    pub fn from_config(config: &IncomingAuthConfig) -> Result<Self> {
        Ok(match config {
            IncomingAuthConfig::Anonymous => AuthProvider::Anonymous,
            IncomingAuthConfig::Local { token } => AuthProvider::Local { token: token.clone() },
            IncomingAuthConfig::Jwt {
                jwks_uri,
                issuer,
                audience,
                allowed_algorithms,
            }
            | IncomingAuthConfig::Oidc {
                jwks_uri,
                issuer,
                audience,
                allowed_algorithms,
            } => AuthProvider::Jwt {
                jwks: Arc::new(JwksCache::new(jwks_uri.clone(), Duration::from_secs(300))),
                issuer: issuer.clone(),
                audience: audience.clone(),
                allowed_algorithms: parse_algorithms(allowed_algorithms)?,
            },
        })
    }

    /// Authenticate a bearer credential (the raw token, `Bearer ` prefix
    /// already stripped by the caller). `None` means no credential was
    /// presented at all.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, GatewayError> {
        match self {
            AuthProvider::Anonymous => Ok(Identity::anonymous()),
            AuthProvider::Local { token } => {
                let presented = credential.ok_or_else(|| GatewayError::Unauthenticated {
                    reason: "missing bearer token".to_string(),
                })?;
                if constant_time_eq(presented, token) {
                    Ok(Identity {
                        subject: "local".to_string(),
                        roles: vec!["admin".to_string()],
                        email: None,
                        display_name: None,
                        provider: "local".to_string(),
                        claims: HashMap::new(),
                    })
                } else {
                    Err(GatewayError::Unauthenticated {
                        reason: "token mismatch".to_string(),
                    })
                }
            }
            AuthProvider::Jwt {
                jwks,
                issuer,
                audience,
                allowed_algorithms,
            } => {
                let token = credential.ok_or_else(|| GatewayError::Unauthenticated {
                    reason: "missing bearer token".to_string(),
                })?;
                self.verify_jwt(token, jwks, issuer, audience, allowed_algorithms).await
            }
        }
    }

    async fn verify_jwt(
        &self,
        token: &str,
        jwks: &JwksCache,
        issuer: &str,
        audience: &str,
        allowed_algorithms: &[Algorithm],
    ) -> Result<Identity, GatewayError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| GatewayError::Unauthenticated {
            reason: format!("malformed token: {e}"),
        })?;
        if !allowed_algorithms.contains(&header.alg) {
            return Err(GatewayError::Unauthenticated {
                reason: format!("algorithm {:?} not permitted", header.alg),
            });
        }
        let kid = header.kid.ok_or_else(|| GatewayError::Unauthenticated {
            reason: "token missing key id".to_string(),
        })?;
        let key = jwks.key(&kid).await.map_err(|e| GatewayError::Unauthenticated {
            reason: format!("key lookup failed: {e}"),
        })?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);

        let decoded = decode::<GatewayClaims>(token, &key, &validation).map_err(|e| GatewayError::Unauthenticated {
            reason: format!("token validation failed: {e}"),
        })?;

        let claims = decoded.claims;
        let subject = claims.sub.clone().unwrap_or_else(|| "unknown".to_string());
        let mut roles = claims.roles.clone();
        if let Some(scope) = &claims.scopes {
            roles.extend(scope.split_whitespace().map(String::from));
        }
        let email = claims.email.clone();
        let display_name = claims.display_name.clone();
        let mut all_claims = claims.rest.clone();
        if let Some(sub) = &claims.sub {
            all_claims.insert("sub".to_string(), Value::String(sub.clone()));
        }

        Ok(Identity {
            subject,
            roles,
            email,
            display_name,
            provider: "jwt".to_string(),
            claims: all_claims,
        })
    }
}

fn parse_algorithms(names: &[String]) -> Result<Vec<Algorithm>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            "RS256" => Ok(Algorithm::RS256),
            "RS384" => Ok(Algorithm::RS384),
            "RS512" => Ok(Algorithm::RS512),
            "ES256" => Ok(Algorithm::ES256),
            "ES384" => Ok(Algorithm::ES384),
            "PS256" => Ok(Algorithm::PS256),
            "PS384" => Ok(Algorithm::PS384),
            "PS512" => Ok(Algorithm::PS512),
            other => Err(anyhow::anyhow!("unsupported JWT algorithm '{other}'")),
        })
        .collect()
}

/// Timing-safe comparison for the local shared-secret provider.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_provider_always_succeeds() {
        let provider = AuthProvider::Anonymous;
        let identity = provider.authenticate(None).await.unwrap();
        assert_eq!(identity.subject, "anonymous");
    }

    #[tokio::test]
    async fn local_provider_rejects_wrong_token() {
        let provider = AuthProvider::Local { token: "s3cret".to_string() };
        let result = provider.authenticate(Some("wrong")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn local_provider_accepts_matching_token() {
        let provider = AuthProvider::Local { token: "s3cret".to_string() };
        let identity = provider.authenticate(Some("s3cret")).await.unwrap();
        assert_eq!(identity.subject, "local");
    }

    #[tokio::test]
    async fn local_provider_requires_a_credential() {
        let provider = AuthProvider::Local { token: "s3cret".to_string() };
        assert!(provider.authenticate(None).await.is_err());
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
