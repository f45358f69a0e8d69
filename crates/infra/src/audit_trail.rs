//! Audit trail: append-only field-change log for transactions.
//!
//! Writing the trail is best-effort. A sink failure is logged and swallowed so it can
//! never block or roll back the ledger write it describes.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use sacco_core::UserId;
use sacco_ledger::{AuditTransaction, Transaction, TransactionId, change_entries, creation_entries};

#[derive(Debug, Error)]
#[error("audit write failed: {0}")]
pub struct AuditWriteError(pub String);

/// Destination of audit rows.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, entries: &[AuditTransaction]) -> Result<(), AuditWriteError>;
}

#[async_trait]
impl<A> AuditSink for Arc<A>
where
    A: AuditSink,
{
    async fn write(&self, entries: &[AuditTransaction]) -> Result<(), AuditWriteError> {
        (**self).write(entries).await
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditTransaction>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditTransaction> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn for_transaction(&self, id: &TransactionId) -> Vec<AuditTransaction> {
        self.entries()
            .into_iter()
            .filter(|e| &e.transaction_id == id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write(&self, entries: &[AuditTransaction]) -> Result<(), AuditWriteError> {
        let mut log = self
            .entries
            .write()
            .map_err(|_| AuditWriteError("audit log lock poisoned".to_string()))?;
        log.extend_from_slice(entries);
        Ok(())
    }
}

/// Diffs transactions into audit rows and hands them to a sink.
#[derive(Debug, Clone)]
pub struct AuditTrail<A> {
    sink: A,
}

impl<A: AuditSink> AuditTrail<A> {
    pub fn new(sink: A) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    /// Record every field of a new transaction. Returns the number of rows written.
    pub async fn record_creation(
        &self,
        tx: &Transaction,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> usize {
        self.write(tx.id(), creation_entries(tx, by, at)).await
    }

    /// Record the fields that differ between `before` and `after`.
    pub async fn record_change(
        &self,
        before: &Transaction,
        after: &Transaction,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> usize {
        self.write(after.id(), change_entries(before, after, by, at))
            .await
    }

    async fn write(&self, id: &TransactionId, entries: Vec<AuditTransaction>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        match self.sink.write(&entries).await {
            Ok(()) => {
                debug!(transaction_id = %id, rows = entries.len(), "audit rows written");
                entries.len()
            }
            Err(err) => {
                warn!(transaction_id = %id, rows = entries.len(), error = %err, "audit write failed; continuing");
                0
            }
        }
    }
}
