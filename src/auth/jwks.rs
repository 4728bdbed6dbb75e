//! Fetches and caches a backend's JSON Web Key Set for JWT/OIDC
//! verification, refreshing it no more than once per `ttl` regardless of
//! how many requests ask for an unknown key id in between.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: Option<String>,
    e: Option<String>,
    #[serde(rename = "k")]
    symmetric: Option<String>,
    kty: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    fetched_at: Instant,
    keys: HashMap<String, DecodingKey>,
}

pub struct JwksCache {
    uri: String,
    ttl: Duration,
    http: reqwest::Client,
    cached: Mutex<Option<CachedKeys>>,
}

impl JwksCache {
    pub fn new(uri: String, ttl: Duration) -> Self {
        Self {
            uri,
            ttl,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub async fn key(&self, kid: &str) -> Result<DecodingKey> {
        let mut guard = self.cached.lock().await;
        let needs_refresh = match &*guard {
            Some(cached) => cached.fetched_at.elapsed() > self.ttl || !cached.keys.contains_key(kid),
            None => true,
        };
        if needs_refresh {
            let keys = self.fetch().await?;
            *guard = Some(CachedKeys {
                fetched_at: Instant::now(),
                keys,
            });
        }
        guard
            .as_ref()
            .and_then(|cached| cached.keys.get(kid))
            .cloned()
            .with_context(|| format!("no JWKS key with id '{kid}'"))
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>> {
        let response = self
            .http
            .get(&self.uri)
            .send()
            .await
            .with_context(|| format!("failed to fetch JWKS from '{}'", self.uri))?;
        let body: JwksResponse = response.json().await.context("invalid JWKS response body")?;

        let mut out = HashMap::new();
        for jwk in body.keys {
            let key = match jwk.kty.as_str() {
                "RSA" => {
                    let (n, e) = (
                        jwk.n.context("RSA JWK missing modulus")?,
                        jwk.e.context("RSA JWK missing exponent")?,
                    );
                    DecodingKey::from_rsa_components(&n, &e)?
                }
                "oct" => {
                    let secret = jwk.symmetric.context("oct JWK missing key material")?;
                    DecodingKey::from_base64_secret(&secret)?
                }
                other => bail!("unsupported JWK key type '{other}'"),
            };
            out.insert(jwk.kid, key);
        }
        Ok(out)
    }
}
