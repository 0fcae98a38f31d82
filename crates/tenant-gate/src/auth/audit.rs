//! Audit events and sinks
//!
//! Recording is best-effort: a sink never blocks or fails the operation that
//! produced the event. [`BufferedAuditSink`] hands events to a background
//! writer through a bounded queue and counts what it had to drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::constants::AUDIT_TARGET;
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Granted,
    Denied,
    Error,
}

impl AuditOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One access decision or operation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub timestamp: SystemTime,
    pub tenant_id: String,
    pub user_id: String,
    pub operation: String,
    pub resource: String,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        operation: impl Into<String>,
        resource: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            operation: operation.into(),
            resource: resource.into(),
            outcome,
        }
    }
}

/// Non-blocking event consumer
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    #[error("audit write failed: {0}")]
    Write(String),
}

/// Durable destination drained by [`BufferedAuditSink`]
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditStoreError>;

    fn name(&self) -> &'static str {
        "audit_store"
    }
}

/// Writes events to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditStore;

impl TracingAuditStore {
    fn emit(event: &AuditEvent) {
        tracing::info!(
            target: AUDIT_TARGET,
            tenant = %event.tenant_id,
            user = %event.user_id,
            operation = %event.operation,
            resource = %event.resource,
            outcome = %event.outcome,
            "audit"
        );
    }
}

#[async_trait]
impl AuditStore for TracingAuditStore {
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        Self::emit(event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

impl AuditSink for TracingAuditStore {
    fn record(&self, event: AuditEvent) {
        Self::emit(&event);
    }
}

/// Collects events in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl AuditStore for MemoryAuditSink {
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditStoreError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Delivery counters of a [`BufferedAuditSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditHealth {
    pub written: u64,
    /// Rejected because the queue was full or closed
    pub dropped: u64,
    /// Accepted but the store failed to persist them
    pub failed: u64,
}

#[derive(Debug, Default)]
struct AuditStats {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

enum Command {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Bounded, non-blocking sink backed by a background writer task
pub struct BufferedAuditSink {
    sender: mpsc::Sender<Command>,
    stats: Arc<AuditStats>,
    store_name: &'static str,
}

impl std::fmt::Debug for BufferedAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedAuditSink")
            .field("store", &self.store_name)
            .field("capacity", &self.sender.max_capacity())
            .field("health", &self.health())
            .finish()
    }
}

impl BufferedAuditSink {
    /// Start the writer task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(store: Arc<dyn AuditStore>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(AuditStats::default());
        let store_name = store.name();

        tokio::spawn(Self::worker(store, receiver, Arc::clone(&stats)));

        Self {
            sender,
            stats,
            store_name,
        }
    }

    async fn worker(
        store: Arc<dyn AuditStore>,
        mut receiver: mpsc::Receiver<Command>,
        stats: Arc<AuditStats>,
    ) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Event(event) => match store.write(&event).await {
                    Ok(()) => {
                        stats.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        observability::record_audit_failed();
                        tracing::warn!(error = %e, store = store.name(), "Audit write failed");
                    }
                },
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Audit writer stopped");
    }

    /// Wait until every event queued before this call has been handled
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn health(&self) -> AuditHealth {
        AuditHealth {
            written: self.stats.written.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

impl AuditSink for BufferedAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.sender.try_send(Command::Event(event)) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            observability::record_audit_dropped();
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("Audit buffer full, event dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!("Audit writer stopped, event dropped");
                }
            }
        }
    }
}
