use async_trait::async_trait;
use sqlx::{Database, Pool, Row, postgres::PgRow};

use crate::outbox::{OutboxMessage, RemoveMessages, TakeMessages, Transactional, UpsertMessages};

/// Type alias for the Postgres SqlxOutbox.
pub type PgOutbox = SqlxOutbox<sqlx::Postgres>;

/// SQLx-based outbox driver.
///
/// Messages live in the `outbox` table of the same database as the entities,
/// so an enqueue can share the entity write's transaction.
pub struct SqlxOutbox<DB>
where
    DB: Database,
{
    pool: Pool<DB>,
}

impl<DB> Clone for SqlxOutbox<DB>
where
    DB: Database,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<DB> SqlxOutbox<DB>
where
    DB: Database,
{
    /// Creates a new outbox without touching the schema.
    pub fn new_uninitialized(pool: Pool<DB>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }
}

impl SqlxOutbox<sqlx::Postgres> {
    /// Creates a new Postgres outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: sqlx::PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl Transactional for SqlxOutbox<sqlx::Postgres> {
    type Error = Error;
    type Transaction = sqlx::PgTransaction<'static>;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.rollback().await?)
    }
}

#[async_trait]
impl UpsertMessages for SqlxOutbox<sqlx::Postgres> {
    /// Insert the message, or replace the payload of the pending row with
    /// the same id. `seq` is left untouched on replacement.
    #[tracing::instrument(skip(self, payload, tx))]
    async fn upsert(
        &self,
        id: &str,
        payload: &[u8],
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error> {
        let row = sqlx::query(
            "INSERT INTO outbox (id, payload) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()
             RETURNING id, payload, seq",
        )
        .bind(id)
        .bind(payload)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| message_from_row(&row)).transpose()
    }
}

#[async_trait]
impl TakeMessages for SqlxOutbox<sqlx::Postgres> {
    /// Delete and return the oldest row that no other transaction holds.
    ///
    /// `SKIP LOCKED` makes a concurrent taker move on to the next row instead
    /// of waiting for, and then re-reading, the same one.
    #[tracing::instrument(skip_all)]
    async fn take_one(
        &self,
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error> {
        let row = sqlx::query(
            "DELETE FROM outbox
             WHERE id = (
                 SELECT id FROM outbox ORDER BY seq LIMIT 1 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, payload, seq",
        )
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| message_from_row(&row)).transpose()
    }
}

#[async_trait]
impl RemoveMessages for SqlxOutbox<sqlx::Postgres> {
    #[tracing::instrument(skip(self, tx))]
    async fn delete_by_id(
        &self,
        id: &str,
        tx: &mut Self::Transaction,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, Error> {
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        seq: row.try_get("seq")?,
    })
}

/// Ensures the outbox table exists.
async fn create_table(pool: &sqlx::PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            id TEXT PRIMARY KEY,
            payload BYTEA NOT NULL,
            seq BIGINT GENERATED ALWAYS AS IDENTITY,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS outbox_seq_idx ON outbox (seq)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    source: sqlx::Error,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn count(pool: &PgPool, id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn enqueue(outbox: &PgOutbox, id: &str, payload: &[u8]) -> OutboxMessage {
        let mut tx = outbox.begin().await.unwrap();
        let message = outbox.upsert(id, payload, &mut tx).await.unwrap().unwrap();
        outbox.commit(tx).await.unwrap();
        message
    }

    #[sqlx::test]
    async fn upsert_replaces_payload_in_place(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();

        let first = enqueue(&outbox, "C1", b"p1").await;
        let second = enqueue(&outbox, "C1", b"p2").await;

        assert_eq!(second.payload(), b"p2");
        assert_eq!(second.seq(), first.seq());
        assert_eq!(count(&pool, "C1").await, 1);
    }

    #[sqlx::test]
    async fn take_one_removes_oldest_message(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();
        enqueue(&outbox, "b", b"1").await;
        enqueue(&outbox, "a", b"2").await;

        let mut tx = outbox.begin().await.unwrap();
        let taken = outbox.take_one(&mut tx).await.unwrap().unwrap();
        outbox.commit(tx).await.unwrap();

        assert_eq!(taken.id(), "b");
        assert_eq!(count(&pool, "b").await, 0);
        assert_eq!(count(&pool, "a").await, 1);
    }

    #[sqlx::test]
    async fn take_one_on_empty_store_returns_none(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool).await.unwrap();

        let mut tx = outbox.begin().await.unwrap();
        assert!(outbox.take_one(&mut tx).await.unwrap().is_none());
        outbox.commit(tx).await.unwrap();
    }

    #[sqlx::test]
    async fn rollback_restores_taken_message(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();
        enqueue(&outbox, "C1", b"payload").await;

        let mut tx = outbox.begin().await.unwrap();
        outbox.take_one(&mut tx).await.unwrap().unwrap();
        outbox.rollback(tx).await.unwrap();

        let payload: Vec<u8> = sqlx::query_scalar("SELECT payload FROM outbox WHERE id = 'C1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(payload, b"payload");
    }

    #[sqlx::test]
    async fn concurrent_takers_skip_locked_row(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();
        enqueue(&outbox, "C1", b"only").await;

        let mut first = outbox.begin().await.unwrap();
        let mut second = outbox.begin().await.unwrap();

        let taken = outbox.take_one(&mut first).await.unwrap();
        let raced = outbox.take_one(&mut second).await.unwrap();

        assert!(taken.is_some());
        assert!(raced.is_none());

        outbox.commit(first).await.unwrap();
        outbox.commit(second).await.unwrap();
        assert_eq!(count(&pool, "C1").await, 0);
    }

    #[sqlx::test]
    async fn delete_by_id_reports_affected_rows(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();
        enqueue(&outbox, "delete", b"payload").await;

        let mut tx = outbox.begin().await.unwrap();
        assert_eq!(outbox.delete_by_id("delete", &mut tx).await.unwrap(), 1);
        assert_eq!(outbox.delete_by_id("delete", &mut tx).await.unwrap(), 0);
        outbox.commit(tx).await.unwrap();
    }

    #[sqlx::test]
    async fn uncommitted_enqueue_is_discarded(pool: PgPool) {
        let outbox = PgOutbox::try_new(pool.clone()).await.unwrap();

        let mut tx = outbox.begin().await.unwrap();
        outbox.upsert("C1", b"payload", &mut tx).await.unwrap();
        outbox.rollback(tx).await.unwrap();

        assert_eq!(count(&pool, "C1").await, 0);
    }
}
