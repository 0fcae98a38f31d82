//! JWKS fetching and caching

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::{AuthError, Result};

/// JSON Web Key
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    /// Key type (RSA, EC)
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub r#use: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Clone)]
struct KeyEntry {
    key: DecodingKey,
    algorithm: Algorithm,
}

/// Immutable snapshot of decoded keys
struct KeySet {
    named: HashMap<String, KeyEntry>,
    unnamed: Vec<KeyEntry>,
    fetched_at: Instant,
}

impl KeySet {
    fn find(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if let Some(kid) = kid {
            return self
                .named
                .get(kid)
                .filter(|entry| entry.algorithm == alg)
                .map(|entry| entry.key.clone())
                .ok_or_else(|| AuthError::KeyNotFound(kid.to_string()));
        }

        self.unnamed
            .iter()
            .chain(self.named.values())
            .find(|entry| entry.algorithm == alg)
            .map(|entry| entry.key.clone())
            .ok_or(AuthError::NoMatchingKey)
    }

    fn len(&self) -> usize {
        self.named.len() + self.unnamed.len()
    }
}

/// Signing keys fetched from a JWKS endpoint, swapped atomically on refresh
pub struct JwksCache {
    keys: ArcSwapOption<KeySet>,
    jwks_uri: Url,
    client: reqwest::Client,
    ttl: Duration,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("jwks_uri", &self.jwks_uri)
            .field("ttl", &self.ttl)
            .field("keys_count", &self.keys_count())
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    pub fn new(jwks_uri: Url, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            keys: ArcSwapOption::empty(),
            jwks_uri,
            client,
            ttl,
        })
    }

    /// Key for `kid`, or the first key matching `alg` when no kid is given
    pub async fn get_key(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if self.needs_refresh() {
            self.refresh().await?;
        }
        self.keys
            .load()
            .as_ref()
            .ok_or(AuthError::NoMatchingKey)?
            .find(kid, alg)
    }

    pub async fn refresh(&self) -> Result<()> {
        tracing::debug!(jwks_uri = %self.jwks_uri, "Refreshing JWKS");

        let jwks: JwkSet = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .map_err(AuthError::JwksFetch)?
            .json()
            .await
            .map_err(|e| AuthError::JwksParse(e.to_string()))?;

        let count = self.install(&jwks)?;
        tracing::info!(keys_count = count, "JWKS refreshed");
        Ok(())
    }

    /// Decode and publish a key set; returns the number of usable keys
    pub(crate) fn install(&self, jwks: &JwkSet) -> Result<usize> {
        let mut named = HashMap::new();
        let mut unnamed = Vec::new();

        for jwk in &jwks.keys {
            let Some((key, algorithm)) = decode_jwk(jwk)? else {
                continue;
            };
            let entry = KeyEntry { key, algorithm };
            match &jwk.kid {
                Some(kid) => {
                    named.insert(kid.clone(), entry);
                }
                None => unnamed.push(entry),
            }
        }

        let set = KeySet {
            named,
            unnamed,
            fetched_at: Instant::now(),
        };
        let count = set.len();
        self.keys.store(Some(Arc::new(set)));
        Ok(count)
    }

    fn needs_refresh(&self) -> bool {
        self.keys
            .load()
            .as_ref()
            .is_none_or(|set| set.fetched_at.elapsed() > self.ttl)
    }

    pub fn keys_count(&self) -> usize {
        self.keys.load().as_ref().map_or(0, |set| set.len())
    }

    /// Refresh keys every `interval` until `shutdown` is cancelled
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        tracing::debug!("JWKS refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            tracing::warn!(error = %e, "Background JWKS refresh failed");
                        }
                    }
                }
            }
        })
    }
}

fn infer_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    match jwk.alg.as_deref() {
        Some("RS256") => Some(Algorithm::RS256),
        Some("RS384") => Some(Algorithm::RS384),
        Some("RS512") => Some(Algorithm::RS512),
        Some("ES256") => Some(Algorithm::ES256),
        Some("ES384") => Some(Algorithm::ES384),
        Some(_) => None,
        None => match (jwk.kty.as_str(), jwk.crv.as_deref()) {
            ("RSA", _) => Some(Algorithm::RS256),
            ("EC", Some("P-256")) => Some(Algorithm::ES256),
            ("EC", Some("P-384")) => Some(Algorithm::ES384),
            _ => None,
        },
    }
}

fn required<'a>(value: Option<&'a String>, what: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| AuthError::JwksParse(format!("missing '{what}'")))
}

fn decode_jwk(jwk: &Jwk) -> Result<Option<(DecodingKey, Algorithm)>> {
    if jwk.r#use.as_deref().is_some_and(|u| u != "sig") {
        return Ok(None);
    }
    let Some(alg) = infer_algorithm(jwk) else {
        return Ok(None);
    };

    let key = match jwk.kty.as_str() {
        "RSA" => DecodingKey::from_rsa_components(
            required(jwk.n.as_ref(), "n")?,
            required(jwk.e.as_ref(), "e")?,
        )
        .map_err(|e| AuthError::JwksParse(format!("invalid RSA components: {e}")))?,
        "EC" => DecodingKey::from_ec_components(
            required(jwk.x.as_ref(), "x")?,
            required(jwk.y.as_ref(), "y")?,
        )
        .map_err(|e| AuthError::JwksParse(format!("invalid EC components: {e}")))?,
        other => {
            tracing::debug!(kty = other, "Skipping unsupported key type");
            return Ok(None);
        }
    };

    Ok(Some((key, alg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> JwksCache {
        JwksCache::new(
            Url::parse("https://example.com/.well-known/jwks.json").unwrap(),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    fn jwk(json: serde_json::Value) -> Jwk {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_jwk_set_deserialize() {
        let json = r#"{"keys": [
            {"kid": "key1", "kty": "RSA", "alg": "RS256", "n": "AQAB", "e": "AQAB"},
            {"kid": "ec-key", "kty": "EC", "crv": "P-256", "x": "AQAB", "y": "AQAB"}
        ]}"#;
        let jwks: JwkSet = serde_json::from_str(json).unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("key1"));
        assert_eq!(jwks.keys[1].crv.as_deref(), Some("P-256"));
    }

    #[test]
    fn test_algorithm_inference() {
        assert_eq!(
            infer_algorithm(&jwk(serde_json::json!({"kty": "RSA"}))),
            Some(Algorithm::RS256)
        );
        assert_eq!(
            infer_algorithm(&jwk(serde_json::json!({"kty": "EC", "crv": "P-384"}))),
            Some(Algorithm::ES384)
        );
        assert_eq!(
            infer_algorithm(&jwk(serde_json::json!({"kty": "EC", "crv": "P-521"}))),
            None
        );
        assert_eq!(
            infer_algorithm(&jwk(serde_json::json!({"kty": "RSA", "alg": "PS256"}))),
            None
        );
    }

    #[test]
    fn test_decode_skips_unusable_keys() {
        let enc = jwk(serde_json::json!({"kty": "RSA", "use": "enc", "n": "AQAB", "e": "AQAB"}));
        assert!(decode_jwk(&enc).unwrap().is_none());

        let oct = jwk(serde_json::json!({"kty": "oct", "alg": "RS256"}));
        assert!(decode_jwk(&oct).unwrap().is_none());

        let incomplete = jwk(serde_json::json!({"kty": "RSA", "alg": "RS256", "n": "AQAB"}));
        assert!(matches!(
            decode_jwk(&incomplete),
            Err(AuthError::JwksParse(_))
        ));
    }

    #[tokio::test]
    async fn test_installed_keys_lookup() {
        let cache = cache();
        assert!(cache.needs_refresh());

        let jwks: JwkSet = serde_json::from_value(serde_json::json!({"keys": [
            {"kid": "k1", "kty": "RSA", "alg": "RS256", "n": "AQAB", "e": "AQAB"},
            {"kty": "RSA", "alg": "RS384", "n": "AQAB", "e": "AQAB"}
        ]}))
        .unwrap();
        assert_eq!(cache.install(&jwks).unwrap(), 2);
        assert!(!cache.needs_refresh());
        assert_eq!(cache.keys_count(), 2);

        assert!(cache.get_key(Some("k1"), Algorithm::RS256).await.is_ok());
        assert!(cache.get_key(None, Algorithm::RS384).await.is_ok());
        assert!(matches!(
            cache.get_key(Some("k1"), Algorithm::RS512).await,
            Err(AuthError::KeyNotFound(_))
        ));
        assert!(matches!(
            cache.get_key(None, Algorithm::ES256).await,
            Err(AuthError::NoMatchingKey)
        ));
    }

    #[tokio::test]
    async fn test_refresh_task_stops_on_shutdown() {
        let cache = Arc::new(cache());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handle = cache.spawn_refresh(Duration::from_secs(300), shutdown);
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
        assert_eq!(cache.keys_count(), 0);
    }
}
