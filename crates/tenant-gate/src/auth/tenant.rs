//! Tenant scoping for protected operations
//!
//! Every protected operation runs inside exactly one [`TenantScope`]. The
//! scope is validated when opened, carries the effective tenant explicitly,
//! and emits a single audit event when it is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::audit::{AuditEvent, AuditOutcome, AuditSink};
use super::config::TenantConfig;
use super::error::{AuthError, Result};
use super::operation::Operation;
use super::query::{Filter, FilterOp, Query, TenantOwned};
use super::user_context::UserContext;
use crate::constants::ADMIN_ROLE;

/// Opens validated tenant scopes
#[derive(Clone)]
pub struct TenantContextManager {
    sink: Arc<dyn AuditSink>,
    tenant_field: String,
}

impl std::fmt::Debug for TenantContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContextManager")
            .field("tenant_field", &self.tenant_field)
            .finish_non_exhaustive()
    }
}

impl TenantContextManager {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_config(sink, &TenantConfig::default())
    }

    #[must_use]
    pub fn with_config(sink: Arc<dyn AuditSink>, config: &TenantConfig) -> Self {
        Self {
            sink,
            tenant_field: config.tenant_field.clone(),
        }
    }

    #[must_use]
    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    /// Whether `ctx` may act on `tenant_id`
    pub fn can_access(&self, ctx: &UserContext, tenant_id: &str, allow_cross_tenant: bool) -> bool {
        ctx.tenant_id() == tenant_id || (allow_cross_tenant && ctx.has_role(ADMIN_ROLE))
    }

    /// Open a scope for one operation on `tenant_id`.
    ///
    /// Fails with [`AuthError::TenantIsolation`] unless the tenant is the
    /// caller's own, or the override is requested by an admin. A rejected
    /// open is audited against the caller's own tenant.
    pub fn open_scope(
        &self,
        tenant_id: &str,
        ctx: Arc<UserContext>,
        operation: &Operation,
        allow_cross_tenant: bool,
    ) -> Result<TenantScope> {
        if !self.can_access(&ctx, tenant_id, allow_cross_tenant) {
            tracing::warn!(
                user = %ctx.user_id(),
                home_tenant = %ctx.tenant_id(),
                operation = %operation.name,
                "Tenant scope rejected"
            );
            self.sink.record(AuditEvent::new(
                ctx.tenant_id(),
                ctx.user_id(),
                &operation.name,
                &operation.resource,
                AuditOutcome::Denied,
            ));
            return Err(AuthError::TenantIsolation);
        }

        let cross_tenant = ctx.tenant_id() != tenant_id;
        if cross_tenant {
            tracing::info!(
                user = %ctx.user_id(),
                operation = %operation.name,
                "Cross-tenant scope opened by admin"
            );
        }

        Ok(TenantScope {
            tenant_id: tenant_id.to_string(),
            ctx,
            cross_tenant,
            operation: operation.name.clone(),
            resource: operation.resource.clone(),
            tenant_field: self.tenant_field.clone(),
            outcome: Mutex::new(AuditOutcome::Error),
            sink: Arc::clone(&self.sink),
        })
    }
}

/// Active tenant context for one operation.
///
/// Not `Clone`: a scope belongs to the operation that opened it. Dropping it
/// records the outcome; an operation that never reports a result (early
/// return, panic, cancelled future) is recorded as an error.
pub struct TenantScope {
    tenant_id: String,
    ctx: Arc<UserContext>,
    cross_tenant: bool,
    operation: String,
    resource: String,
    tenant_field: String,
    outcome: Mutex<AuditOutcome>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantScope")
            .field("tenant_id", &self.tenant_id)
            .field("user", &self.ctx.user_id())
            .field("cross_tenant", &self.cross_tenant)
            .field("operation", &self.operation)
            .field("outcome", &*self.outcome.lock())
            .finish_non_exhaustive()
    }
}

impl TenantScope {
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub fn user(&self) -> &UserContext {
        &self.ctx
    }

    /// True when an admin override targets a tenant other than the caller's own
    #[must_use]
    pub const fn is_cross_tenant(&self) -> bool {
        self.cross_tenant
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn outcome(&self) -> AuditOutcome {
        *self.outcome.lock()
    }

    /// Replace every constraint on the tenant field with one equality on this scope's tenant
    #[must_use]
    pub fn add_tenant_filter(&self, mut query: Query) -> Query {
        query.filters.retain(|f| f.field != self.tenant_field);
        query.filters.push(Filter::new(
            self.tenant_field.clone(),
            FilterOp::Eq,
            Value::String(self.tenant_id.clone()),
        ));
        query
    }

    /// Keep only records owned by this scope's tenant
    pub fn filter_results_by_tenant<T: TenantOwned>(&self, results: Vec<T>) -> Vec<T> {
        let before = results.len();
        let kept: Vec<T> = results
            .into_iter()
            .filter(|r| r.tenant_in(&self.tenant_field) == Some(self.tenant_id.as_str()))
            .collect();
        if kept.len() != before {
            tracing::warn!(
                operation = %self.operation,
                removed = before - kept.len(),
                "Dropped records outside the active tenant"
            );
        }
        kept
    }

    /// Fail unless `record` belongs to this scope's tenant
    pub fn assert_ownership<T: TenantOwned + ?Sized>(&self, record: &T) -> Result<()> {
        if record.tenant_in(&self.tenant_field) == Some(self.tenant_id.as_str()) {
            return Ok(());
        }
        tracing::warn!(
            user = %self.ctx.user_id(),
            operation = %self.operation,
            "Record ownership check failed"
        );
        *self.outcome.lock() = AuditOutcome::Denied;
        Err(AuthError::TenantIsolation)
    }

    /// Map an operation result onto the scope outcome
    pub fn record_result<T>(&self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Granted,
            Err(e) if e.is_authorization() => AuditOutcome::Denied,
            Err(_) => AuditOutcome::Error,
        };
        self.set_outcome(outcome);
    }

    /// Set the outcome; a recorded denial is never upgraded
    pub fn set_outcome(&self, outcome: AuditOutcome) {
        let mut current = self.outcome.lock();
        if *current != AuditOutcome::Denied {
            *current = outcome;
        }
    }
}

impl Drop for TenantScope {
    fn drop(&mut self) {
        let outcome = *self.outcome.get_mut();
        tracing::debug!(
            user = %self.ctx.user_id(),
            operation = %self.operation,
            outcome = %outcome,
            "Tenant scope released"
        );
        self.sink.record(AuditEvent::new(
            self.tenant_id.clone(),
            self.ctx.user_id(),
            std::mem::take(&mut self.operation),
            std::mem::take(&mut self.resource),
            outcome,
        ));
    }
}
