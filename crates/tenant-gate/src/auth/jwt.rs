//! Access token signature and claim verification

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode_header};

use super::claims::JwtClaims;
use super::config::JwtConfig;
use super::error::{AuthError, Result};
use super::jwks::JwksCache;

/// Verifies access tokens against a shared secret or a JWKS
pub struct ClaimsVerifier {
    config: JwtConfig,
    jwks_cache: Option<Arc<JwksCache>>,
    hs_key: Option<DecodingKey>,
}

impl std::fmt::Debug for ClaimsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsVerifier")
            .field("issuer", &self.config.issuer)
            .field("has_jwks_cache", &self.jwks_cache.is_some())
            .field("has_hs_key", &self.hs_key.is_some())
            .finish()
    }
}

impl ClaimsVerifier {
    #[must_use]
    pub fn new(config: JwtConfig, jwks_cache: Option<Arc<JwksCache>>) -> Self {
        let hs_key = config
            .hs_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        Self {
            config,
            jwks_cache,
            hs_key,
        }
    }

    /// Build from config, creating a JWKS cache when a URI is configured
    pub fn from_config(config: JwtConfig) -> Result<Self> {
        let cache = match &config.jwks_uri {
            Some(uri) => Some(Arc::new(JwksCache::new(uri.clone(), config.jwks_cache_ttl)?)),
            None => None,
        };
        if cache.is_none() && config.hs_secret.is_none() {
            return Err(AuthError::Config(
                "no verification key: set an HS secret or a JWKS URI".to_string(),
            ));
        }
        Ok(Self::new(config, cache))
    }

    #[must_use]
    pub const fn jwks_cache(&self) -> Option<&Arc<JwksCache>> {
        self.jwks_cache.as_ref()
    }

    /// Check signature, issuer, audience and lifetime; return the claims
    pub async fn verify(&self, token: &str) -> Result<JwtClaims> {
        let header = decode_header(token).map_err(|_| AuthError::InvalidToken)?;
        let key = self
            .get_decoding_key(header.kid.as_deref(), header.alg)
            .await?;

        let mut validation = Validation::new(header.alg);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer.as_str().trim_end_matches('/')]);
        }
        if self.config.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audience);
        }
        validation.validate_nbf = true;
        validation.leeway = self.config.clock_skew.as_secs();

        let data = jsonwebtoken::decode::<JwtClaims>(token, &key, &validation)
            .inspect_err(|e| tracing::debug!(error = %e, "Token verification failed"))?;
        Ok(data.claims)
    }

    async fn get_decoding_key(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return self
                .hs_key
                .clone()
                .ok_or_else(|| AuthError::Config("HS secret not configured".into()));
        }

        let jwks_cache = self.jwks_cache.as_ref().ok_or_else(|| {
            AuthError::Config("JWKS not configured for asymmetric algorithm".into())
        })?;
        jwks_cache.get_key(kid, alg).await
    }
}
