//! Credential provider boundary

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::config::ProviderConfig;
use super::error::{AuthError, Result};
use super::tokens::TokenSet;

/// Login credentials
#[derive(Clone)]
pub enum Credentials {
    Password { username: String, password: String },
    ClientCredentials,
    AuthorizationCode { code: String, redirect_uri: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::ClientCredentials => f.write_str("ClientCredentials"),
            Self::AuthorizationCode { redirect_uri, .. } => f
                .debug_struct("AuthorizationCode")
                .field("redirect_uri", redirect_uri)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    #[must_use]
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    const fn grant_type(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::ClientCredentials => "client_credentials",
            Self::AuthorizationCode { .. } => "authorization_code",
        }
    }
}

/// Issues, refreshes and revokes tokens
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue_token(&self, credentials: &Credentials) -> Result<TokenSet>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet>;

    /// Whether the provider still considers the access token active
    async fn introspect(&self, access_token: &str) -> Result<bool>;

    async fn end_session(&self, refresh_token: &str) -> Result<()>;
}

/// Provider used when no token endpoint is configured; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredProvider;

#[async_trait]
impl CredentialProvider for UnconfiguredProvider {
    async fn issue_token(&self, _credentials: &Credentials) -> Result<TokenSet> {
        Err(AuthError::Config("credential provider not configured".to_string()))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenSet> {
        Err(AuthError::RefreshFailed(
            "credential provider not configured".to_string(),
        ))
    }

    async fn introspect(&self, _access_token: &str) -> Result<bool> {
        Err(AuthError::Config("credential provider not configured".to_string()))
    }

    async fn end_session(&self, _refresh_token: &str) -> Result<()> {
        Ok(())
    }
}

/// Token endpoint response body
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            refresh_token: r.refresh_token.unwrap_or_default(),
            id_token: r.id_token,
            expires_in: r.expires_in,
            refresh_expires_in: r.refresh_expires_in.unwrap_or(0),
            token_type: r.token_type.unwrap_or_else(|| "Bearer".to_string()),
            received_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
}

/// OAuth2/OIDC provider reached over HTTP form posts
pub struct HttpCredentialProvider {
    config: ProviderConfig,
    token_endpoint: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentialProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpCredentialProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| AuthError::Config("token endpoint not configured".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(Duration::from_secs(10)))
            .build()
            .map_err(|e| AuthError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            config,
            token_endpoint,
            client,
        })
    }

    fn client_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("client_id", self.config.client_id.clone())];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }
        params
    }

    async fn post_token(&self, params: Vec<(&'static str, String)>) -> Result<TokenSet> {
        let response = self
            .client
            .post(self.token_endpoint.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::CredentialRejected(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::CredentialRejected(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::CredentialRejected(format!("malformed token response: {e}")))?;
        Ok(body.into())
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn issue_token(&self, credentials: &Credentials) -> Result<TokenSet> {
        let mut params = self.client_params();
        params.push(("grant_type", credentials.grant_type().to_string()));
        match credentials {
            Credentials::Password { username, password } => {
                params.push(("username", username.clone()));
                params.push(("password", password.clone()));
            }
            Credentials::ClientCredentials => {}
            Credentials::AuthorizationCode { code, redirect_uri } => {
                params.push(("code", code.clone()));
                params.push(("redirect_uri", redirect_uri.clone()));
            }
        }
        tracing::debug!(grant = credentials.grant_type(), "Requesting token");
        self.post_token(params).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet> {
        let mut params = self.client_params();
        params.push(("grant_type", "refresh_token".to_string()));
        params.push(("refresh_token", refresh_token.to_string()));
        self.post_token(params)
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))
    }

    async fn introspect(&self, access_token: &str) -> Result<bool> {
        let Some(endpoint) = &self.config.introspection_endpoint else {
            return Err(AuthError::Config(
                "introspection endpoint not configured".to_string(),
            ));
        };
        let mut params = self.client_params();
        params.push(("token", access_token.to_string()));

        let response = self
            .client
            .post(endpoint.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::CredentialRejected(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| AuthError::CredentialRejected(e.to_string()))?;
        Ok(body.active)
    }

    async fn end_session(&self, refresh_token: &str) -> Result<()> {
        let Some(endpoint) = &self.config.end_session_endpoint else {
            tracing::debug!("No end-session endpoint configured");
            return Ok(());
        };
        let mut params = self.client_params();
        params.push(("refresh_token", refresh_token.to_string()));

        let response = self
            .client
            .post(endpoint.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::CredentialRejected(e.without_url().to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthError::CredentialRejected(format!(
                "end-session returned {}",
                response.status()
            )))
        }
    }
}
