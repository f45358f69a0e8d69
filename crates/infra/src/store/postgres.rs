//! Postgres-backed ledger store and audit sink.
//!
//! Every row lives in `ledger_rows` as a JSONB body keyed by the text form of its
//! [`EntityKey`]. A locked scope is one SQL transaction that reads its rows with
//! `SELECT ... ORDER BY key FOR UPDATE`, so concurrent scopes queue on the row locks in
//! the same order and the settlement latch is checked and flipped under those locks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / RowNotFound / Other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row as _, Transaction as SqlTransaction};
use tracing::{Span, instrument};

use sacco_ledger::{AuditTransaction, Transaction};

use super::r#trait::{EntityKey, LedgerStore, LockedRows, Row, RowKind, StoreError};
use crate::audit_trail::{AuditSink, AuditWriteError};

/// Schema for `ledger_rows` and `audit_transactions`.
pub const MIGRATION: &str = include_str!("../../migrations/0001_ledger.sql");

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// An audit sink writing to the same database.
    pub fn audit_sink(&self) -> PostgresAuditSink {
        PostgresAuditSink {
            pool: self.pool.clone(),
        }
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, row), fields(key = %row.key()), err)]
    async fn insert(&self, row: Row) -> Result<(), StoreError> {
        let key = row.key();
        let body = encode(&row)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_rows (key, kind, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key.to_string())
        .bind(row.kind().as_str())
        .bind(&body)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(key.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, row), fields(key = %row.key()), err)]
    async fn upsert(&self, row: Row) -> Result<(), StoreError> {
        let body = encode(&row)?;
        sqlx::query(
            r#"
            INSERT INTO ledger_rows (key, kind, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                body = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(row.key().to_string())
        .bind(row.kind().as_str())
        .bind(&body)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn get(&self, key: &EntityKey) -> Result<Option<Row>, StoreError> {
        let row = sqlx::query("SELECT body FROM ledger_rows WHERE key = $1")
            .bind(key.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_body(&r)).transpose()
    }

    #[instrument(skip(self), fields(kind = kind.as_str(), row_count = tracing::field::Empty), err)]
    async fn list(&self, kind: RowKind) -> Result<Vec<Row>, StoreError> {
        let rows = sqlx::query("SELECT body FROM ledger_rows WHERE kind = $1 ORDER BY key")
            .bind(kind.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        Span::current().record("row_count", rows.len());
        rows.iter().map(decode_body).collect()
    }

    #[instrument(skip(self), err)]
    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT body FROM ledger_rows
            WHERE kind = 'transaction'
              AND (
                body -> 'transaction' -> 'provider' ->> 'checkout_request_id' = $1
                OR body -> 'transaction' -> 'provider' ->> 'merchant_request_id' = $1
                OR body -> 'transaction' -> 'provider' ->> 'provider_transaction_id' = $1
              )
            LIMIT 1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_correlation", e))?;

        match row.map(|r| decode_body(&r)).transpose()? {
            Some(Row::Transaction(tx)) => Ok(Some(tx)),
            Some(other) => Err(StoreError::KindMismatch {
                key: other.key().to_string(),
                expected: "transaction",
            }),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, work), fields(key_count = keys.len()))]
    async fn with_locked<R, E, F>(&self, keys: &[EntityKey], work: F) -> Result<R, E>
    where
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut LockedRows) -> Result<R, E> + Send + 'static,
    {
        let mut wanted: Vec<String> = keys.iter().map(ToString::to_string).collect();
        wanted.sort();
        wanted.dedup();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let locked = lock_rows(&mut tx, &wanted).await?;
        if locked.len() != wanted.len() {
            let missing = wanted
                .iter()
                .find(|key| !locked.iter().any(|row| &row.key().to_string() == *key))
                .cloned()
                .unwrap_or_default();
            rollback(tx).await?;
            return Err(StoreError::NotFound(missing).into());
        }

        let mut copies = LockedRows::from_rows(locked);
        let out = match work(&mut copies) {
            Ok(out) => out,
            Err(err) => {
                rollback(tx).await?;
                return Err(err);
            }
        };

        for row in copies.into_rows() {
            let body = encode(&row)?;
            sqlx::query("UPDATE ledger_rows SET body = $2, updated_at = NOW() WHERE key = $1")
                .bind(row.key().to_string())
                .bind(&body)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_row", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(out)
    }
}

/// Read and lock `keys` in ascending order inside `tx`.
async fn lock_rows(
    tx: &mut SqlTransaction<'_, Postgres>,
    keys: &[String],
) -> Result<Vec<Row>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT key, body FROM ledger_rows
        WHERE key = ANY($1)
        ORDER BY key
        FOR UPDATE
        "#,
    )
    .bind(keys)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_rows", e))?;

    rows.iter().map(decode_body).collect()
}

async fn rollback(tx: SqlTransaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

fn encode(row: &Row) -> Result<JsonValue, StoreError> {
    serde_json::to_value(row).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(body: JsonValue) -> Result<Row, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_body(row: &sqlx::postgres::PgRow) -> Result<Row, StoreError> {
    let body: JsonValue = row
        .try_get("body")
        .map_err(|e| StoreError::Serialization(format!("failed to read body: {e}")))?;
    decode(body)
}

/// Audit rows in `audit_transactions`; one SQL transaction per batch.
#[derive(Debug, Clone)]
pub struct PostgresAuditSink {
    pool: Arc<PgPool>,
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    #[instrument(skip(self, entries), fields(entry_count = entries.len()), err)]
    async fn write(&self, entries: &[AuditTransaction]) -> Result<(), AuditWriteError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AuditWriteError(map_sqlx_error("begin_transaction", e).to_string()))?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO audit_transactions (
                    id,
                    transaction_id,
                    transaction_type,
                    field_name,
                    old_value,
                    new_value,
                    updated_by,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.id)
            .bind(entry.transaction_id.as_str())
            .bind(entry.transaction_type.as_str())
            .bind(&entry.field_name)
            .bind(&entry.old_value)
            .bind(&entry.new_value)
            .bind(entry.updated_by.map(|u| *u.as_uuid()))
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AuditWriteError(map_sqlx_error("insert_audit", e).to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AuditWriteError(map_sqlx_error("commit_transaction", e).to_string()))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
