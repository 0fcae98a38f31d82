//! Session state machine and per-operation access decisions
//!
//! The gate ties the pieces together: it owns the session's tokens and
//! identity, answers role and permission queries for the presentation layer,
//! and admits or refuses each protected operation before any data is touched.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use super::audit::{
    AuditEvent, AuditHealth, AuditOutcome, AuditSink, AuditStore, BufferedAuditSink,
    TracingAuditStore,
};
use super::config::AuthConfig;
use super::error::{AuthError, ErrorKind, Result};
use super::identity::IdentityResolver;
use super::jwt::ClaimsVerifier;
use super::operation::GuardRequest;
use super::provider::{CredentialProvider, Credentials, HttpCredentialProvider, UnconfiguredProvider};
use super::rbac::{DenyReason, PermissionEvaluator, RoleRegistry};
use super::tenant::{TenantContextManager, TenantScope};
use super::tokens::{TokenLifecycleManager, TokenSet};
use super::user_context::UserContext;
use crate::constants::DEFAULT_REFRESH_TIMEOUT;
use crate::observability;

const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Initializing,
    Unauthenticated,
    Authenticating,
    Authenticated,
    Error,
}

impl AuthState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
        }
    }

    /// Numeric value exported on the auth state gauge
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Unauthenticated => 1,
            Self::Authenticating => 2,
            Self::Authenticated => 3,
            Self::Error => 4,
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum GuardDecision {
    Admit,
    Deny(DenyReason),
    RedirectToLogin,
}

impl GuardDecision {
    #[must_use]
    pub const fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

struct Session {
    state: AuthState,
    user: Option<Arc<UserContext>>,
    /// Bumped by login and logout; results of requests started under an
    /// older epoch are discarded
    epoch: u64,
}

/// Decision plus the user it was made for
enum Verdict {
    Admit(Arc<UserContext>),
    Deny(DenyReason, Arc<UserContext>),
    Redirect,
}

impl Verdict {
    const fn label(&self) -> &'static str {
        match self {
            Self::Admit(_) => "admit",
            Self::Deny(..) => "deny",
            Self::Redirect => "redirect",
        }
    }

    fn into_decision(self) -> GuardDecision {
        match self {
            Self::Admit(_) => GuardDecision::Admit,
            Self::Deny(reason, _) => GuardDecision::Deny(reason),
            Self::Redirect => GuardDecision::RedirectToLogin,
        }
    }
}

/// Builder for [`AuthorizationGate`]
pub struct GateBuilder {
    verifier: ClaimsVerifier,
    provider: Arc<dyn CredentialProvider>,
    resolver: IdentityResolver,
    registry: Arc<RoleRegistry>,
    sink: Arc<dyn AuditSink>,
    buffered: Option<Arc<BufferedAuditSink>>,
    refresh_threshold: Duration,
    refresh_timeout: Duration,
}

impl std::fmt::Debug for GateBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateBuilder")
            .field("verifier", &self.verifier)
            .field("buffered_audit", &self.buffered)
            .field("refresh_threshold", &self.refresh_threshold)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish_non_exhaustive()
    }
}

impl GateBuilder {
    #[must_use]
    pub fn new(verifier: ClaimsVerifier) -> Self {
        Self {
            verifier,
            provider: Arc::new(UnconfiguredProvider),
            resolver: IdentityResolver::new(super::config::IdentityConfig::default()),
            registry: Arc::new(RoleRegistry::seeded()),
            sink: Arc::new(TracingAuditStore),
            buffered: None,
            refresh_threshold: crate::constants::DEFAULT_REFRESH_THRESHOLD,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Verifier, identity mapping, timings, HTTP provider and a buffered
    /// tracing audit sink from config.
    ///
    /// Must be called inside a tokio runtime, which hosts the audit writer.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AuthError::Config(
                "buffered audit sink requires a tokio runtime".to_string(),
            ));
        }
        let verifier = ClaimsVerifier::from_config(config.jwt.clone())?;
        let mut builder = Self::new(verifier)
            .buffered_audit(Arc::new(TracingAuditStore), config.audit_buffer)
            .identity(IdentityResolver::new(config.identity.clone()))
            .refresh_threshold(config.tokens.refresh_threshold)
            .refresh_timeout(config.tokens.refresh_timeout);
        if config.provider.token_endpoint.is_some() {
            builder = builder.provider(Arc::new(HttpCredentialProvider::new(
                config.provider.clone(),
            )?));
        }
        Ok(builder)
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn identity(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<RoleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Unbuffered sink; replaces any buffered sink set earlier
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self.buffered = None;
        self
    }

    /// Queue events for `store` through a bounded [`BufferedAuditSink`]
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn buffered_audit(mut self, store: Arc<dyn AuditStore>, capacity: usize) -> Self {
        let buffered = Arc::new(BufferedAuditSink::spawn(store, capacity));
        self.sink = Arc::clone(&buffered) as Arc<dyn AuditSink>;
        self.buffered = Some(buffered);
        self
    }

    #[must_use]
    pub const fn refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<AuthorizationGate> {
        let tenants =
            TenantContextManager::with_config(Arc::clone(&self.sink), &self.resolver.config().tenant);
        let (state_tx, _) = watch::channel(AuthState::Initializing);

        let gate = Arc::new_cyclic(|weak: &Weak<AuthorizationGate>| {
            let tokens = TokenLifecycleManager::new(self.refresh_threshold);

            let on_refresh = weak.clone();
            tokens.on_refresh_needed(move || {
                let Some(gate) = on_refresh.upgrade() else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = gate.refresh_session().await {
                                tracing::warn!(error = %e, "Scheduled token refresh failed");
                            }
                        });
                    }
                    Err(_) => tracing::warn!("No async runtime for scheduled refresh"),
                }
            });

            let on_expired = weak.clone();
            tokens.on_expired(move || {
                if let Some(gate) = on_expired.upgrade() {
                    gate.handle_expired();
                }
            });

            AuthorizationGate {
                verifier: self.verifier,
                provider: self.provider,
                resolver: self.resolver,
                evaluator: PermissionEvaluator::new(self.registry),
                tenants,
                tokens,
                sink: self.sink,
                buffered: self.buffered,
                session: RwLock::new(Session {
                    state: AuthState::Initializing,
                    user: None,
                    epoch: 0,
                }),
                state_tx,
                refresh_timeout: self.refresh_timeout,
                refresh_lock: tokio::sync::Mutex::new(()),
            }
        });
        observability::set_auth_state(AuthState::Initializing.code());
        gate
    }
}

/// Admits or refuses protected operations for one session
pub struct AuthorizationGate {
    verifier: ClaimsVerifier,
    provider: Arc<dyn CredentialProvider>,
    resolver: IdentityResolver,
    evaluator: PermissionEvaluator,
    tenants: TenantContextManager,
    tokens: TokenLifecycleManager,
    sink: Arc<dyn AuditSink>,
    buffered: Option<Arc<BufferedAuditSink>>,
    session: RwLock<Session>,
    state_tx: watch::Sender<AuthState>,
    refresh_timeout: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.session.read();
        f.debug_struct("AuthorizationGate")
            .field("state", &session.state)
            .field("user", &session.user.as_ref().map(|u| u.user_id().to_string()))
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl AuthorizationGate {
    #[must_use]
    pub fn builder(verifier: ClaimsVerifier) -> GateBuilder {
        GateBuilder::new(verifier)
    }

    pub fn state(&self) -> AuthState {
        self.session.read().state
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    pub fn user(&self) -> Option<Arc<UserContext>> {
        self.session.read().user.clone()
    }

    #[must_use]
    pub const fn verifier(&self) -> &ClaimsVerifier {
        &self.verifier
    }

    #[must_use]
    pub const fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    #[must_use]
    pub const fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    #[must_use]
    pub const fn tenants(&self) -> &TenantContextManager {
        &self.tenants
    }

    /// Delivery counters when the gate audits through a buffered sink
    pub fn audit_health(&self) -> Option<AuditHealth> {
        self.buffered.as_ref().map(|b| b.health())
    }

    /// Wait for queued audit events to reach the store
    pub async fn flush_audit(&self) {
        if let Some(buffered) = &self.buffered {
            buffered.flush().await;
        }
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.user()
            .is_some_and(|user| self.evaluator.has_role(&user, name))
    }

    pub fn has_permission(&self, resource: &str, action: &str) -> bool {
        self.user()
            .is_some_and(|user| self.evaluator.has_permission(&user, resource, action))
    }

    fn transition(&self, session: &mut Session, state: AuthState) {
        if session.state != state {
            tracing::info!(from = %session.state, to = %state, "Auth state changed");
            session.state = state;
            self.state_tx.send_replace(state);
            observability::set_auth_state(state.code());
        }
    }

    fn set_state(&self, state: AuthState, user: Option<Arc<UserContext>>) {
        let mut session = self.session.write();
        session.user = user;
        self.transition(&mut session, state);
    }

    fn epoch(&self) -> u64 {
        self.session.read().epoch
    }

    fn end_session(&self, session: &mut Session) {
        if matches!(
            session.state,
            AuthState::Authenticated | AuthState::Initializing
        ) {
            session.user = None;
            self.transition(session, AuthState::Unauthenticated);
        }
    }

    fn handle_expired(&self) {
        let mut session = self.session.write();
        self.end_session(&mut session);
    }

    /// Verify the access token, resolve identity, then install the set.
    ///
    /// Nothing is installed when the session epoch moved past `epoch` while
    /// the token was being verified.
    async fn establish(&self, tokens: TokenSet, epoch: u64) -> Result<Arc<UserContext>> {
        let claims = self.verifier.verify(&tokens.access_token).await?;
        let user = Arc::new(self.resolver.resolve(&claims)?);
        {
            let mut session = self.session.write();
            if session.epoch != epoch {
                tracing::debug!(epoch, current = session.epoch, "Discarding stale token set");
                return Err(AuthError::SessionSuperseded);
            }
            self.tokens.set_tokens(tokens);
            session.user = Some(Arc::clone(&user));
            self.transition(&mut session, AuthState::Authenticated);
        }
        tracing::info!(user = %user.user_id(), roles = user.roles().len(), "Session established");
        Ok(user)
    }

    /// Ask the provider whether a stored access token is still active.
    ///
    /// A provider without introspection defers to local verification; any
    /// other failure counts as inactive.
    async fn still_active(&self, access_token: &str) -> bool {
        match self.provider.introspect(access_token).await {
            Ok(active) => active,
            Err(e) if e.kind() == ErrorKind::Configuration => {
                tracing::debug!(error = %e, "Introspection unavailable, relying on signature checks");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Introspection failed, treating stored credential as inactive");
                false
            }
        }
    }

    /// Resume from persisted tokens, if any.
    ///
    /// An unexpired access token is introspected before it is trusted.
    pub async fn initialize(&self, stored: Option<TokenSet>) -> AuthState {
        let Some(mut tokens) = stored else {
            self.set_state(AuthState::Unauthenticated, None);
            return self.state();
        };

        // Lifetimes count from receipt, not from this call
        let age = SystemTime::now()
            .duration_since(tokens.received_at)
            .unwrap_or_default()
            .as_secs();
        tokens.expires_in = tokens.expires_in.saturating_sub(age);
        tokens.refresh_expires_in = tokens.refresh_expires_in.saturating_sub(age);
        tokens.received_at += Duration::from_secs(age);

        if tokens.expires_in == 0 {
            if tokens.refresh_expires_in == 0 {
                self.set_state(AuthState::Unauthenticated, None);
                return self.state();
            }
            self.tokens.set_tokens(tokens);
            if let Err(e) = self.refresh_session().await {
                tracing::info!(error = %e, "Stored session could not be refreshed");
            }
            return self.state();
        }

        let epoch = self.epoch();
        if !self.still_active(&tokens.access_token).await {
            tracing::info!("Stored credential is no longer active at the provider");
            {
                let mut session = self.session.write();
                if session.epoch == epoch {
                    self.end_session(&mut session);
                }
            }
            return self.state();
        }

        match self.establish(tokens, epoch).await {
            Ok(_) | Err(AuthError::SessionSuperseded) => {}
            Err(e) if e.kind() == ErrorKind::Configuration => {
                tracing::error!(error = %e, "Stored credential cannot be mapped to an identity");
                self.tokens.clear();
                self.set_state(AuthState::Error, None);
            }
            Err(e) => {
                tracing::info!(error = %e, "Stored credential rejected");
                self.tokens.clear();
                self.set_state(AuthState::Unauthenticated, None);
            }
        }
        self.state()
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Arc<UserContext>> {
        let epoch = {
            let mut session = self.session.write();
            if session.state == AuthState::Authenticating {
                return Err(AuthError::LoginInProgress);
            }
            session.epoch += 1;
            self.tokens.clear();
            session.user = None;
            self.transition(&mut session, AuthState::Authenticating);
            session.epoch
        };

        let result = match self.provider.issue_token(credentials).await {
            Ok(tokens) => self.establish(tokens, epoch).await,
            Err(e) => Err(e),
        };

        result.inspect_err(|e| {
            tracing::warn!(error = %e, "Login failed");
            let mut session = self.session.write();
            if session.epoch == epoch {
                self.tokens.clear();
                session.user = None;
                self.transition(&mut session, AuthState::Error);
            }
        })
    }

    /// Drop the session locally, then end it at the provider on a best-effort basis
    pub async fn logout(&self) {
        let (refresh_token, user) = {
            let mut session = self.session.write();
            session.epoch += 1;
            let refresh_token = self.tokens.refresh_token();
            self.tokens.clear();
            let user = session.user.take();
            self.transition(&mut session, AuthState::Unauthenticated);
            (refresh_token, user)
        };

        if let Some(rt) = refresh_token.filter(|t| !t.is_empty()) {
            if let Err(e) = self.provider.end_session(&rt).await {
                tracing::warn!(error = %e, "Provider end-session failed");
            }
        }
        if let Some(user) = user {
            tracing::info!(user = %user.user_id(), "Logged out");
        }
    }

    /// Exchange the refresh token for a new set.
    ///
    /// Any failure expires the session, which moves the gate to
    /// `Unauthenticated`. Concurrent calls collapse into the one in flight.
    /// A refresh that completes after a logout or a new login is discarded
    /// with [`AuthError::SessionSuperseded`] and leaves the session alone.
    pub async fn refresh_session(&self) -> Result<()> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            tracing::debug!("Refresh already in progress");
            return Ok(());
        };

        let epoch = self.epoch();
        let result = self.try_refresh(epoch).await;
        observability::record_refresh(result.is_ok());
        match &result {
            Ok(()) => {}
            Err(AuthError::SessionSuperseded) => {
                tracing::info!("Session changed during refresh, result discarded");
            }
            Err(e) => {
                let mut session = self.session.write();
                if session.epoch == epoch {
                    tracing::warn!(error = %e, "Token refresh failed, ending session");
                    self.tokens.clear();
                    self.end_session(&mut session);
                }
            }
        }
        result
    }

    async fn try_refresh(&self, epoch: u64) -> Result<()> {
        if !self.tokens.refresh_token_valid() {
            return Err(AuthError::RefreshTokenExpired);
        }
        let refresh_token = self
            .tokens
            .refresh_token()
            .ok_or(AuthError::RefreshTokenExpired)?;

        let tokens = tokio::time::timeout(
            self.refresh_timeout,
            self.provider.refresh_token(&refresh_token),
        )
        .await
        .map_err(|_| AuthError::RefreshTimeout(self.refresh_timeout))?
        .map_err(|e| match e {
            AuthError::RefreshFailed(_) | AuthError::RefreshTokenExpired => e,
            other => AuthError::RefreshFailed(other.to_string()),
        })?;

        self.establish(tokens, epoch).await.map_err(|e| match e {
            AuthError::SessionSuperseded => e,
            other => AuthError::RefreshFailed(other.to_string()),
        })?;
        tracing::debug!("Token refresh succeeded");
        Ok(())
    }

    /// Decide without auditing
    fn decide(&self, request: &GuardRequest) -> Verdict {
        let (state, user) = {
            let session = self.session.read();
            (session.state, session.user.clone())
        };
        if state != AuthState::Authenticated {
            return Verdict::Redirect;
        }
        // Detecting expiry here takes the session lock, so it must not be held
        if !self.tokens.has_valid() {
            return Verdict::Redirect;
        }
        let Some(user) = user else {
            return Verdict::Redirect;
        };
        if user.is_expired_at(SystemTime::now()) {
            self.tokens.expire();
            return Verdict::Redirect;
        }

        let reason = DenyReason {
            missing_roles: self.evaluator.missing_roles(&user, &request.required_roles),
            missing_permissions: self
                .evaluator
                .missing_permissions(&user, &request.required_permissions),
            tenant_denied: request.tenant_id.as_deref().is_some_and(|tenant| {
                !self
                    .tenants
                    .can_access(&user, tenant, request.allow_cross_tenant)
            }),
        };

        if reason.is_empty() {
            Verdict::Admit(user)
        } else {
            Verdict::Deny(reason, user)
        }
    }

    fn audit_verdict(&self, request: &GuardRequest, verdict: &Verdict) {
        observability::record_guard_decision(verdict.label());
        let (tenant, user_id, outcome) = match verdict {
            Verdict::Admit(u) => (
                request.tenant_id.as_deref().unwrap_or_else(|| u.tenant_id()),
                u.user_id(),
                AuditOutcome::Granted,
            ),
            // Refusals are recorded against the caller's own tenant
            Verdict::Deny(reason, u) => {
                tracing::info!(
                    user = %u.user_id(),
                    operation = %request.operation.name,
                    reason = %reason,
                    "Access denied"
                );
                (u.tenant_id(), u.user_id(), AuditOutcome::Denied)
            }
            Verdict::Redirect => ("", ANONYMOUS, AuditOutcome::Denied),
        };
        self.sink.record(AuditEvent::new(
            tenant,
            user_id,
            &request.operation.name,
            &request.operation.resource,
            outcome,
        ));
    }

    /// Decide one access and audit the decision
    pub fn guard(&self, request: &GuardRequest) -> GuardDecision {
        let verdict = self.decide(request);
        self.audit_verdict(request, &verdict);
        verdict.into_decision()
    }

    /// Guard the request and open its tenant scope.
    ///
    /// On admission the scope owns the audit record; refusals are audited here.
    pub fn enter(&self, request: &GuardRequest) -> Result<TenantScope> {
        match self.decide(request) {
            Verdict::Admit(user) => {
                observability::record_guard_decision("admit");
                let tenant = request
                    .tenant_id
                    .clone()
                    .unwrap_or_else(|| user.tenant_id().to_string());
                self.tenants.open_scope(
                    &tenant,
                    user,
                    &request.operation,
                    request.allow_cross_tenant,
                )
            }
            verdict => {
                self.audit_verdict(request, &verdict);
                Err(match verdict.into_decision() {
                    GuardDecision::Deny(reason)
                        if reason.missing_roles.is_empty()
                            && reason.missing_permissions.is_empty() =>
                    {
                        AuthError::TenantIsolation
                    }
                    GuardDecision::Deny(reason) => AuthError::AccessDenied(reason),
                    GuardDecision::Admit | GuardDecision::RedirectToLogin => {
                        AuthError::NotAuthenticated
                    }
                })
            }
        }
    }

    /// Run `op` inside a guarded tenant scope and record its result on the scope
    pub async fn execute<T, F>(&self, request: &GuardRequest, op: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s TenantScope) -> BoxFuture<'s, Result<T>>,
    {
        let scope = self.enter(request)?;
        let result = op(&scope).await;
        scope.record_result(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::auth::audit::MemoryAuditSink;
    use crate::auth::config::JwtConfig;
    use crate::auth::jwt::tests::{ISSUER, SECRET, mint, now};
    use crate::auth::operation::Operation;
    use crate::auth::query::Query;

    #[derive(Clone, Copy)]
    enum RefreshMode {
        Succeed,
        Slow,
        Reject,
        Hang,
    }

    struct FakeProvider {
        tenant: String,
        roles: Vec<String>,
        expires_in: u64,
        refresh_expires_in: u64,
        refresh_mode: Mutex<RefreshMode>,
        /// `None` behaves like a provider without an introspection endpoint
        introspection: Mutex<Option<bool>>,
        refresh_calls: AtomicUsize,
        end_session_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(tenant: &str, roles: &[&str]) -> Self {
            Self {
                tenant: tenant.to_string(),
                roles: roles.iter().map(ToString::to_string).collect(),
                expires_in: 300,
                refresh_expires_in: 1800,
                refresh_mode: Mutex::new(RefreshMode::Succeed),
                introspection: Mutex::new(Some(true)),
                refresh_calls: AtomicUsize::new(0),
                end_session_calls: AtomicUsize::new(0),
            }
        }

        fn lifetimes(mut self, expires_in: u64, refresh_expires_in: u64) -> Self {
            self.expires_in = expires_in;
            self.refresh_expires_in = refresh_expires_in;
            self
        }

        fn token_set(&self, user: &str) -> TokenSet {
            let access = mint(
                &json!({
                    "sub": user,
                    "iss": ISSUER,
                    "exp": now() + 3600,
                    "tenant_id": self.tenant,
                    "realm_access": {"roles": self.roles},
                }),
                SECRET,
            );
            TokenSet::new(access, format!("refresh-{user}"))
                .with_lifetimes(self.expires_in, self.refresh_expires_in)
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeProvider {
        async fn issue_token(&self, credentials: &Credentials) -> Result<TokenSet> {
            match credentials {
                Credentials::Password { username, password } if password == "correct" => {
                    Ok(self.token_set(username))
                }
                _ => Err(AuthError::CredentialRejected("invalid_grant".into())),
            }
        }

        async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let mode = *self.refresh_mode.lock();
            match mode {
                RefreshMode::Succeed => {
                    let user = refresh_token.trim_start_matches("refresh-");
                    Ok(self.token_set(user))
                }
                RefreshMode::Slow => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let user = refresh_token.trim_start_matches("refresh-");
                    Ok(self.token_set(user))
                }
                RefreshMode::Reject => Err(AuthError::RefreshFailed("invalid_grant".into())),
                RefreshMode::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn introspect(&self, _access_token: &str) -> Result<bool> {
            (*self.introspection.lock())
                .ok_or_else(|| AuthError::Config("introspection endpoint not configured".into()))
        }

        async fn end_session(&self, _refresh_token: &str) -> Result<()> {
            self.end_session_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn verifier() -> ClaimsVerifier {
        ClaimsVerifier::new(
            JwtConfig::new(Url::parse(ISSUER).unwrap()).with_hs_secret(SECRET.to_string()),
            None,
        )
    }

    fn gate(provider: Arc<FakeProvider>) -> (Arc<AuthorizationGate>, MemoryAuditSink) {
        let sink = MemoryAuditSink::new();
        let gate = AuthorizationGate::builder(verifier())
            .provider(provider)
            .audit_sink(Arc::new(sink.clone()))
            .build();
        (gate, sink)
    }

    async fn logged_in(
        tenant: &str,
        roles: &[&str],
    ) -> (Arc<AuthorizationGate>, MemoryAuditSink, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new(tenant, roles));
        let (gate, sink) = gate(Arc::clone(&provider));
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();
        (gate, sink, provider)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn read_alerts() -> GuardRequest {
        GuardRequest::new(Operation::new("list_alerts", "alerts", "read"))
    }

    fn write_alerts() -> GuardRequest {
        GuardRequest::new(Operation::new("update_alert", "alerts", "write"))
    }

    #[tokio::test]
    async fn test_initial_state_and_empty_initialize() {
        let (gate, _sink) = gate(Arc::new(FakeProvider::new("acme", &["viewer"])));
        assert_eq!(gate.state(), AuthState::Initializing);
        assert_eq!(gate.initialize(None).await, AuthState::Unauthenticated);
        assert!(gate.user().is_none());
    }

    #[tokio::test]
    async fn test_initialize_with_stored_tokens() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let stored = provider.token_set("alice");
        let (gate, _sink) = gate(Arc::new(provider));

        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Authenticated);
        assert_eq!(gate.user().unwrap().tenant_id(), "acme");
    }

    #[tokio::test]
    async fn test_resumed_session_keeps_stored_deadline() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let mut stored = provider.token_set("alice");
        stored.received_at -= Duration::from_secs(100);
        let deadline = stored.received_at + Duration::from_secs(stored.expires_in);
        let (gate, _sink) = gate(Arc::new(provider));

        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Authenticated);
        let current = gate.tokens().get_valid_tokens().unwrap();
        let resumed = current.received_at + Duration::from_secs(current.expires_in);
        let drift = resumed
            .duration_since(deadline)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2), "deadline drifted by {drift:?}");
    }

    #[tokio::test]
    async fn test_initialize_rejects_token_revoked_at_provider() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let stored = provider.token_set("alice");
        *provider.introspection.lock() = Some(false);
        let (gate, _sink) = gate(Arc::new(provider));

        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Unauthenticated);
        assert!(gate.user().is_none());
        assert!(!gate.tokens().has_valid());
    }

    #[tokio::test]
    async fn test_initialize_without_introspection_trusts_signature() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let stored = provider.token_set("alice");
        *provider.introspection.lock() = None;
        let (gate, _sink) = gate(Arc::new(provider));

        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_initialize_with_foreign_token_is_unauthenticated() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let mut stored = provider.token_set("alice");
        stored.access_token = mint(
            &json!({"sub": "alice", "iss": ISSUER, "exp": now() + 3600, "tenant_id": "acme"}),
            "some-other-secret-at-least-32-bytes-long",
        );
        let (gate, _sink) = gate(Arc::new(provider));
        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_initialize_without_tenant_claim_is_error_state() {
        let provider = FakeProvider::new("acme", &["viewer"]);
        let mut stored = provider.token_set("alice");
        stored.access_token = mint(
            &json!({"sub": "alice", "iss": ISSUER, "exp": now() + 3600}),
            SECRET,
        );
        let (gate, _sink) = gate(Arc::new(provider));
        assert_eq!(gate.initialize(Some(stored)).await, AuthState::Error);
        assert!(!gate.tokens().has_valid());
    }

    #[tokio::test]
    async fn test_login_and_state_broadcast() {
        let provider = Arc::new(FakeProvider::new("acme", &["operator"]));
        let (gate, _sink) = gate(provider);
        let mut rx = gate.subscribe();

        let user = gate
            .login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();
        assert_eq!(user.user_id(), "alice");
        assert_eq!(gate.state(), AuthState::Authenticated);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AuthState::Authenticated);

        assert!(gate.has_role("operator"));
        assert!(!gate.has_role("admin"));
        assert!(gate.has_permission("alerts", "acknowledge"));
        assert!(!gate.has_permission("users", "invite"));
    }

    #[tokio::test]
    async fn test_login_failure_enters_error_state() {
        let (gate, _sink) = gate(Arc::new(FakeProvider::new("acme", &["viewer"])));
        let err = gate
            .login(&Credentials::password("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(err.is_session_fatal());
        assert_eq!(gate.state(), AuthState::Error);
        assert!(!gate.tokens().has_valid());

        // Error is recoverable by logging in again
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();
        assert_eq!(gate.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let (gate, _sink, provider) = logged_in("acme", &["viewer"]).await;
        gate.logout().await;

        assert_eq!(gate.state(), AuthState::Unauthenticated);
        assert!(gate.user().is_none());
        assert!(!gate.tokens().has_valid());
        assert!(gate.tokens().armed_refresh().is_none());
        assert_eq!(provider.end_session_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.guard(&read_alerts()), GuardDecision::RedirectToLogin);
    }

    #[tokio::test]
    async fn test_viewer_read_admitted_write_denied() {
        let (gate, sink, _provider) = logged_in("acme", &["viewer"]).await;
        sink.take();

        assert_eq!(gate.guard(&read_alerts()), GuardDecision::Admit);

        let GuardDecision::Deny(reason) = gate.guard(&write_alerts()) else {
            panic!("expected denial");
        };
        assert_eq!(reason.missing_permissions, vec!["alerts:write"]);
        assert!(!reason.tenant_denied);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Granted);
        assert_eq!(events[1].outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn test_guard_names_missing_roles() {
        let (gate, _sink, _provider) = logged_in("acme", &["viewer"]).await;
        let request = read_alerts().with_roles(["operator", "tenant-admin"]);

        let GuardDecision::Deny(reason) = gate.guard(&request) else {
            panic!("expected denial");
        };
        assert_eq!(reason.missing_roles, vec!["operator", "tenant-admin"]);
        assert!(reason.missing_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_guard_foreign_tenant_never_echoed() {
        let (gate, sink, _provider) = logged_in("acme", &["viewer"]).await;
        sink.take();

        let decision = gate.guard(&read_alerts().for_tenant("globex"));
        let GuardDecision::Deny(reason) = &decision else {
            panic!("expected denial");
        };
        assert!(reason.tenant_denied);
        assert!(!reason.to_string().contains("globex"));
        assert!(!serde_json::to_string(&decision).unwrap().contains("globex"));

        let events = sink.events();
        assert_eq!(events[0].tenant_id, "acme");
        assert_eq!(events[0].outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn test_execute_filters_and_audits_once() {
        let (gate, sink, _provider) = logged_in("acme", &["viewer"]).await;
        sink.take();

        let rows = gate
            .execute(&read_alerts(), |scope| {
                async move {
                    let query =
                        scope.add_tenant_filter(Query::new().where_eq("tenant_id", "globex"));
                    assert_eq!(query.filters.len(), 1);
                    let fetched = vec![
                        json!({"id": 1, "tenant_id": "acme"}),
                        json!({"id": 2, "tenant_id": "globex"}),
                    ];
                    Ok(scope.filter_results_by_tenant(fetched))
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Granted);
        assert_eq!(events[0].operation, "list_alerts");
    }

    #[tokio::test]
    async fn test_execute_records_failures() {
        let (gate, sink, _provider) = logged_in("acme", &["viewer"]).await;
        sink.take();

        let result: Result<()> = gate
            .execute(&read_alerts(), |scope| {
                async move { scope.assert_ownership(&json!({"tenant_id": "globex"})) }.boxed()
            })
            .await;
        assert!(result.unwrap_err().is_tenant_isolation());

        let result: Result<()> = gate
            .execute(&read_alerts(), |_scope| {
                async move { Err(AuthError::Config("backend down".into())) }.boxed()
            })
            .await;
        assert!(result.is_err());

        let outcomes: Vec<AuditOutcome> = sink.events().iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec![AuditOutcome::Denied, AuditOutcome::Error]);
        assert_eq!(gate.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_enter_refusals() {
        let (gate, sink, _provider) = logged_in("acme", &["viewer"]).await;
        sink.take();

        assert!(matches!(
            gate.enter(&write_alerts()),
            Err(AuthError::AccessDenied(_))
        ));
        assert!(matches!(
            gate.enter(&read_alerts().for_tenant("globex").cross_tenant(true)),
            Err(AuthError::TenantIsolation)
        ));
        assert_eq!(sink.len(), 2);

        gate.logout().await;
        assert!(matches!(
            gate.enter(&read_alerts()),
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_admin_cross_tenant_execute() {
        let (gate, sink, _provider) = logged_in("acme", &["admin"]).await;
        sink.take();

        let request = read_alerts().for_tenant("globex").cross_tenant(true);
        let rows = gate
            .execute(&request, |scope| {
                async move {
                    assert!(scope.is_cross_tenant());
                    Ok(scope.filter_results_by_tenant(vec![
                        json!({"id": 1, "tenant_id": "acme"}),
                        json!({"id": 2, "tenant_id": "globex"}),
                    ]))
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": 2, "tenant_id": "globex"})]);
        assert_eq!(sink.events()[0].tenant_id, "globex");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_refresh_token_logs_out() {
        let provider = Arc::new(FakeProvider::new("acme", &["viewer"]).lifetimes(300, 0));
        let (gate, _sink) = gate(Arc::clone(&provider));
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();

        let err = gate.refresh_session().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshTokenExpired));
        assert_eq!(err.kind(), ErrorKind::Refresh);
        assert_eq!(gate.state(), AuthState::Unauthenticated);
        assert!(gate.user().is_none());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_logs_out() {
        let (gate, _sink, provider) = logged_in("acme", &["viewer"]).await;
        *provider.refresh_mode.lock() = RefreshMode::Reject;

        let err = gate.refresh_session().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(gate.state(), AuthState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_logs_out() {
        let (gate, _sink, provider) = logged_in("acme", &["viewer"]).await;
        *provider.refresh_mode.lock() = RefreshMode::Hang;

        let err = gate.refresh_session().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshTimeout(_)));
        assert_eq!(gate.state(), AuthState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_keeps_session() {
        let provider = Arc::new(FakeProvider::new("acme", &["viewer"]).lifetimes(40, 1800));
        let (gate, _sink) = gate(Arc::clone(&provider));
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();
        assert_eq!(gate.tokens().armed_refresh().unwrap().generation, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state(), AuthState::Authenticated);
        assert_eq!(gate.tokens().armed_refresh().unwrap().generation, 2);
        assert_eq!(gate.guard(&read_alerts()), GuardDecision::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiry_redirects_to_login() {
        let provider = Arc::new(FakeProvider::new("acme", &["viewer"]).lifetimes(40, 1800));
        *provider.refresh_mode.lock() = RefreshMode::Hang;
        let gate = AuthorizationGate::builder(verifier())
            .provider(provider)
            .refresh_timeout(Duration::from_secs(120))
            .audit_sink(Arc::new(MemoryAuditSink::new()))
            .build();
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(gate.guard(&read_alerts()), GuardDecision::RedirectToLogin);
        assert_eq!(gate.state(), AuthState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_stays_logged_out() {
        let (gate, _sink, provider) = logged_in("acme", &["viewer"]).await;
        *provider.refresh_mode.lock() = RefreshMode::Slow;

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh_session().await })
        };
        settle().await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);

        gate.logout().await;
        let result = pending.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionSuperseded)));
        assert_eq!(gate.state(), AuthState::Unauthenticated);
        assert!(gate.user().is_none());
        assert!(!gate.tokens().has_valid());
        assert!(gate.tokens().armed_refresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_refresh_leaves_newer_login_alone() {
        let (gate, _sink, provider) = logged_in("acme", &["viewer"]).await;
        *provider.refresh_mode.lock() = RefreshMode::Slow;

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh_session().await })
        };
        settle().await;

        gate.login(&Credentials::password("bob", "correct"))
            .await
            .unwrap();
        let result = pending.await.unwrap();

        assert!(matches!(result, Err(AuthError::SessionSuperseded)));
        assert_eq!(gate.state(), AuthState::Authenticated);
        assert_eq!(gate.user().unwrap().user_id(), "bob");
        assert_eq!(gate.tokens().refresh_token().as_deref(), Some("refresh-bob"));
    }

    fn hs_config(audit_buffer: usize) -> AuthConfig {
        AuthConfig {
            jwt: JwtConfig::new(Url::parse(ISSUER).unwrap()).with_hs_secret(SECRET.to_string()),
            audit_buffer,
            ..AuthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_from_config_audits_through_buffer() {
        let gate = GateBuilder::from_config(&hs_config(8))
            .unwrap()
            .provider(Arc::new(FakeProvider::new("acme", &["viewer"])))
            .build();
        gate.login(&Credentials::password("alice", "correct"))
            .await
            .unwrap();
        gate.flush_audit().await;
        let before = gate.audit_health().unwrap();

        assert!(gate.guard(&read_alerts()).is_admit());
        assert!(!gate.guard(&write_alerts()).is_admit());
        gate.flush_audit().await;

        let after = gate.audit_health().unwrap();
        assert_eq!(after.written, before.written + 2);
        assert_eq!(after.dropped, 0);
        assert_eq!(after.failed, 0);
    }

    #[test]
    fn test_from_config_outside_runtime_is_config_error() {
        let err = GateBuilder::from_config(&hs_config(8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_explicit_sink_has_no_buffer_health() {
        let (gate, _sink) = gate(Arc::new(FakeProvider::new("acme", &["viewer"])));
        assert!(gate.audit_health().is_none());
        gate.flush_audit().await;
    }

    #[tokio::test]
    async fn test_concurrent_login_rejected() {
        let (gate, _sink) = gate(Arc::new(FakeProvider::new("acme", &["viewer"])));
        {
            let mut session = gate.session.write();
            gate.transition(&mut session, AuthState::Authenticating);
        }
        assert!(matches!(
            gate.login(&Credentials::password("alice", "correct")).await,
            Err(AuthError::LoginInProgress)
        ));
    }
}
