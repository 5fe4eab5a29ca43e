//! Postgres-backed outbox store.
//!
//! Each signal type has its own outbox table. Burst flushing relies on
//! `FOR UPDATE SKIP LOCKED`; ordered flushing takes a plain blocking
//! `FOR UPDATE` on the stream head so concurrent flushers serialize.
//! Inserts raise a `pg_notify` hint (delivered at commit) that
//! `wait_for_pending` listens for.
//!
//! ## Error Mapping
//!
//! | PostgreSQL error code | `StoreError` |
//! |-----------------------|--------------|
//! | `40001` (serialization failure) | `Serialization` |
//! | `40P01` (deadlock detected) | `Serialization` |
//! | pool/IO failures | `Connection` |
//! | anything else | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::instrument;

use signalbus_core::{SignalDescriptor, SignalId, SignalRow};

use crate::error::{StoreError, StoreResult};
use crate::store::{OutboxStore, OutboxTx};

/// Notification channel raised when new rows are recorded.
pub const PENDING_CHANNEL: &str = "signalbus_pending";

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table (and order index) for a signal type if it
    /// does not exist yet.
    #[instrument(skip(self), fields(table = %signal.table))]
    pub async fn ensure_table(&self, signal: &SignalDescriptor) -> StoreResult<()> {
        let table = ident(&signal.table)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id UUID PRIMARY KEY,
                payload JSONB NOT NULL,
                position BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;

        if signal.is_ordered() {
            let idx = format!(
                r#"CREATE INDEX IF NOT EXISTS "{table}_order_idx" ON "{table}" ({}, id)"#,
                order_column(signal)?
            );
            sqlx::query(&idx)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_table", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Tx = PostgresOutboxTx;

    async fn begin(&self) -> StoreResult<PostgresOutboxTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PostgresOutboxTx { tx })
    }

    async fn pending_count(&self, signal: &SignalDescriptor) -> StoreResult<u64> {
        let table = ident(&signal.table)?;
        let count: i64 = sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{table}""#))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_count", e))?;
        Ok(count.max(0) as u64)
    }

    async fn pending_ids(
        &self,
        signal: &SignalDescriptor,
        limit: usize,
    ) -> StoreResult<Vec<SignalId>> {
        let table = ident(&signal.table)?;
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(&format!(
            r#"SELECT id FROM "{table}" ORDER BY id LIMIT $1"#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_ids", e))?;
        Ok(ids.into_iter().map(SignalId::from_uuid).collect())
    }

    /// Listen for the pending-rows hint.
    ///
    /// Rows committed between the caller's pending check and the LISTEN
    /// taking effect are not seen; the grace period bounds that window.
    async fn wait_for_pending(&self, grace: Duration) -> StoreResult<bool> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        listener
            .listen(PENDING_CHANNEL)
            .await
            .map_err(|e| map_sqlx_error("wait_for_pending", e))?;
        match tokio::time::timeout(grace, listener.recv()).await {
            Ok(Ok(_notification)) => Ok(true),
            Ok(Err(e)) => Err(StoreError::Connection(e.to_string())),
            Err(_elapsed) => Ok(false),
        }
    }
}

pub struct PostgresOutboxTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxTx for PostgresOutboxTx {
    async fn insert(
        &mut self,
        signal: &SignalDescriptor,
        rows: Vec<SignalRow>,
    ) -> StoreResult<()> {
        let table = ident(&signal.table)?;
        let query = format!(
            r#"INSERT INTO "{table}" (id, payload, position, created_at) VALUES ($1, $2, $3, $4)"#
        );
        for row in &rows {
            sqlx::query(&query)
                .bind(row.id.as_uuid())
                .bind(&row.payload)
                .bind(row.position)
                .bind(row.created_at)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("insert", e))?;
        }
        if !rows.is_empty() {
            // Delivered to listeners when this transaction commits.
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(PENDING_CHANNEL)
                .bind(&signal.name)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("insert", e))?;
        }
        Ok(())
    }

    async fn lock_pending(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>> {
        let table = ident(&signal.table)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, payload, position, created_at
            FROM "{table}"
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_pending", e))?;
        decode_rows(signal, rows)
    }

    async fn lock_ids(
        &mut self,
        signal: &SignalDescriptor,
        ids: &[SignalId],
    ) -> StoreResult<Vec<SignalRow>> {
        let table = ident(&signal.table)?;
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, payload, position, created_at
            FROM "{table}"
            WHERE id = ANY($1)
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(&uuids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_ids", e))?;
        decode_rows(signal, rows)
    }

    async fn lock_ordered(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>> {
        let table = ident(&signal.table)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, payload, position, created_at
            FROM "{table}"
            ORDER BY {}, id
            LIMIT $1
            FOR UPDATE
            "#,
            order_column(signal)?
        ))
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_ordered", e))?;
        decode_rows(signal, rows)
    }

    async fn delete(&mut self, signal: &SignalDescriptor, ids: &[SignalId]) -> StoreResult<u64> {
        let table = ident(&signal.table)?;
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(&format!(r#"DELETE FROM "{table}" WHERE id = ANY($1)"#))
            .bind(&uuids)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Validate a SQL identifier before interpolating it. Identifiers come
/// from descriptors built at startup, never from request data.
fn ident(name: &str) -> StoreResult<&str> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::storage(
            "identifier",
            format!("invalid SQL identifier: {name:?}"),
        ))
    }
}

/// The column backing the ordered-flush sort. The schema stores the order
/// key in the single `position` column, so a descriptor declaring anything
/// else is a configuration mistake and is rejected before any DDL or
/// locking runs.
fn order_column(signal: &SignalDescriptor) -> StoreResult<&'static str> {
    match signal.order_key.as_deref() {
        None => Ok("position"),
        Some([column]) if column == "position" => Ok("position"),
        Some(other) => Err(StoreError::storage(
            "order_key",
            format!("this store orders by the \"position\" column only, got {other:?}"),
        )),
    }
}

fn decode_rows(signal: &SignalDescriptor, rows: Vec<PgRow>) -> StoreResult<Vec<SignalRow>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let decoded = OutboxRow::from_row(&row)
            .map_err(|e| StoreError::storage("decode_row", e.to_string()))?;
        out.push(decoded.into_signal_row(&signal.name));
    }
    Ok(out)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            // 40001: serialization failure, 40P01: deadlock detected.
            // Both are transient and safe to retry in a fresh transaction.
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                StoreError::Serialization(db_err.message().to_string())
            } else {
                StoreError::storage(operation, db_err.message().to_string())
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Connection(format!("{operation}: {err}"))
        }
        _ => StoreError::storage(operation, err.to_string()),
    }
}

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    payload: serde_json::Value,
    position: Option<i64>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            position: row.try_get("position")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl OutboxRow {
    fn into_signal_row(self, signal: &str) -> SignalRow {
        SignalRow {
            id: SignalId::from_uuid(self.id),
            signal: signal.to_string(),
            payload: self.payload,
            position: self.position,
            created_at: self.created_at,
        }
    }
}
