//! OIDC discovery of provider endpoints

use std::time::Duration;

use openidconnect::IssuerUrl;
use openidconnect::core::CoreProviderMetadata;
use url::Url;

use super::config::AuthConfig;
use super::error::{AuthError, Result};

/// Endpoints published in the provider's discovery document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoints {
    pub issuer: Url,
    pub jwks_uri: Url,
    pub token_endpoint: Option<Url>,
}

impl DiscoveredEndpoints {
    /// Fill endpoints that are not configured explicitly
    pub fn apply(self, config: &mut AuthConfig) {
        if config.jwt.issuer.is_none() {
            config.jwt.issuer = Some(self.issuer);
        }
        if config.jwt.jwks_uri.is_none() {
            config.jwt.jwks_uri = Some(self.jwks_uri);
        }
        if config.provider.token_endpoint.is_none() {
            config.provider.token_endpoint = self.token_endpoint;
        }
    }
}

fn parse_url(value: &str, what: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| AuthError::DiscoveryFailed(format!("invalid {what}: {e}")))
}

/// Fetch `/.well-known/openid-configuration` for `issuer`
pub async fn discover(issuer: &Url) -> Result<DiscoveredEndpoints> {
    let issuer_url = IssuerUrl::new(issuer.as_str().trim_end_matches('/').to_string())
        .map_err(|e| AuthError::Config(format!("invalid issuer URL: {e}")))?;
    tracing::info!(issuer = %issuer_url, "Discovering OIDC provider");

    // openidconnect re-exports its own reqwest version
    let http_client = openidconnect::reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .redirect(openidconnect::reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| AuthError::Config(format!("HTTP client: {e}")))?;

    let metadata = CoreProviderMetadata::discover_async(issuer_url, &http_client)
        .await
        .map_err(|e| AuthError::DiscoveryFailed(e.to_string()))?;

    let endpoints = DiscoveredEndpoints {
        issuer: parse_url(metadata.issuer().as_str(), "issuer")?,
        jwks_uri: parse_url(metadata.jwks_uri().as_str(), "JWKS URI")?,
        token_endpoint: metadata
            .token_endpoint()
            .map(|t| parse_url(t.as_str(), "token endpoint"))
            .transpose()?,
    };
    tracing::info!(jwks_uri = %endpoints.jwks_uri, "OIDC discovery complete");
    Ok(endpoints)
}
