//! OP key resolution with a per-process JWKS cache.
//!
//! The verify process is short-lived, so the cache is a plain mutex-guarded
//! map: one discovery + one key-set fetch per issuer, refreshed when an entry
//! ages out or a presented `kid` is not in the cached set. A `kid` that is
//! still unknown after one forced refresh is an error: key rotation at the
//! OP is expected, retry loops are not.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use opkssh_common::{
    error::AuthError,
    jwk::{Jwk, JwkSet, RsaJwk},
};
use opkssh_token::OpKeyResolver;

/// Cache entry lifetime when the OP sends no caching headers.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Deadline for each HTTP request to the OP.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

struct CachedJwks {
    keys: JwkSet,
    expires_at: Instant,
}

/// Fetches and caches OP signing keys by issuer.
pub struct JwksResolver {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CachedJwks>>,
}

impl JwksResolver {
    pub fn new() -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("opkssh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// GET a JSON document, retrying once with jitter on transient I/O.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<Duration>), AuthError> {
        match self.try_get(url).await {
            Err(AuthError::Io(first)) | Err(AuthError::IoTimeout(first)) => {
                let jitter = rand::thread_rng().gen_range(50..250);
                debug!(url, error = %first, jitter_ms = jitter, "retrying OP fetch");
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                self.try_get(url).await
            }
            result => result,
        }
    }

    async fn try_get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<Duration>), AuthError> {
        let response = self.http.get(url).send().await.map_err(request_err)?;
        if !response.status().is_success() {
            return Err(AuthError::Io(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let ttl = cache_max_age(&response);
        let body = response.json::<T>().await.map_err(request_err)?;
        Ok((body, ttl))
    }

    /// Discovery then key-set fetch for one issuer.
    async fn fetch(&self, issuer: &str) -> Result<CachedJwks, AuthError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let (discovery, _) = self.get_json::<DiscoveryDocument>(&discovery_url).await?;
        let (keys, ttl) = self.get_json::<JwkSet>(&discovery.jwks_uri).await?;
        debug!(issuer, keys = keys.keys.len(), "fetched JWKS");
        Ok(CachedJwks {
            keys,
            expires_at: Instant::now() + ttl.unwrap_or(DEFAULT_TTL),
        })
    }
}

fn request_err(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::IoTimeout(err.to_string())
    } else {
        AuthError::Io(err.to_string())
    }
}

/// `Cache-Control: max-age=N`, if the OP sent one.
fn cache_max_age(response: &reqwest::Response) -> Option<Duration> {
    let header = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?;
    header.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

fn find_rsa(keys: &JwkSet, kid: &str) -> Option<RsaJwk> {
    match keys.find(kid) {
        Some(Jwk::Rsa(jwk)) => Some(jwk.clone()),
        Some(_) => {
            warn!(kid, "JWKS entry for kid is not an RSA key");
            None
        }
        None => None,
    }
}

#[async_trait]
impl OpKeyResolver for JwksResolver {
    async fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaJwk, AuthError> {
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.get(issuer) {
            if entry.expires_at > Instant::now() {
                if let Some(jwk) = find_rsa(&entry.keys, kid) {
                    return Ok(jwk);
                }
                debug!(issuer, kid, "kid miss, forcing JWKS refresh");
            }
        }

        let fresh = self.fetch(issuer).await?;
        let resolved = find_rsa(&fresh.keys, kid);
        cache.insert(issuer.to_string(), fresh);
        resolved.ok_or_else(|| AuthError::UnknownKid(kid.to_string()))
    }
}
