//! Outbox abstractions and backend drivers.
//!
//! This module implements the *outbox pattern*: a message describing an
//! entity write is persisted in the same transaction as the write itself and
//! delivered later by the [`Scheduler`](crate::Scheduler).
//!
//! The outbox is responsible for **durability and ordering**, while delivery
//! concerns are delegated to the scheduler and transport layers.
//!
//! ## Responsibilities
//!
//! - Persist one pending message per entity id, atomically with the entity
//! - Hand out the oldest pending message exactly once per transaction
//! - Remove messages by id
//!
//! ## Components
//!
//! - [`Outbox`]: High-level façade used by the entity write path
//! - [`Transactional`]: Begin, commit and roll back store transactions
//! - [`UpsertMessages`]: Insert or replace a pending message
//! - [`TakeMessages`]: Atomically read and remove the next message
//! - [`RemoveMessages`]: Delete a pending message by id
//!
//! Concrete implementations are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use serde::Serialize;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::transport::TransportError;

/// Error returned by outbox, write path and delivery operations.
///
/// The set of kinds is closed so callers can tell a permanent failure from
/// one that the next scheduler tick may resolve, see
/// [`OutboxError::is_retryable`].
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Classification of [`OutboxError`]s.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The entity snapshot could not be serialized.
    Serialization(serde_json::Error),
    /// The queue store could not complete an operation.
    Store(tower::BoxError),
    /// A taken message was not confirmed by the broker.
    Delivery(DeliveryFailure),
}

/// Why a delivery attempt did not succeed.
#[derive(Debug)]
pub enum DeliveryFailure {
    /// The broker answered with a negative confirmation.
    NotConfirmed { id: String },
    /// The transport failed before a confirmation arrived.
    Transport { id: String, source: TransportError },
}

impl OutboxError {
    pub(crate) fn serialization(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Serialization(err),
        }
    }

    pub(crate) fn store(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Store(err.into()),
        }
    }

    pub(crate) fn delivery(failure: DeliveryFailure) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Delivery(failure),
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }

    /// Whether the failed operation may succeed when attempted again.
    ///
    /// Store and delivery failures are transient from the outbox point of
    /// view; a serialization failure will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, OutboxErrorKind::Serialization(_))
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => writeln!(f, "Serialization error: {err}"),
            OutboxErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            OutboxErrorKind::Delivery(DeliveryFailure::NotConfirmed { id }) => {
                writeln!(f, "Delivery error: broker did not confirm message {id}")
            }
            OutboxErrorKind::Delivery(DeliveryFailure::Transport { id, source }) => {
                writeln!(f, "Delivery error: message {id} failed: {source}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Serialization(err) => Some(err),
            OutboxErrorKind::Store(err) => Some(err.as_ref()),
            OutboxErrorKind::Delivery(DeliveryFailure::NotConfirmed { .. }) => None,
            OutboxErrorKind::Delivery(DeliveryFailure::Transport { source, .. }) => Some(source),
        }
    }
}

/// Message stored in the outbox.
///
/// The id is the originating entity's primary key and doubles as the dedup
/// key downstream. `seq` is assigned on first insert and fixes the position
/// in the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub(crate) id: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) seq: i64,
}

impl OutboxMessage {
    /// Build a message that has not been stored yet.
    ///
    /// `seq` is 0 until a store assigns one, so this is mainly useful for
    /// exercising a [`Sender`](crate::transport::Sender) directly.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }
}

/// Error returned when an upsert reports that nothing was stored.
#[derive(Debug)]
struct NotStored(String);

impl std::fmt::Display for NotStored {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "message {} was not stored", self.0)
    }
}

impl std::error::Error for NotStored {}

/// High-level façade over an outbox backend.
///
/// `Outbox` is what the entity write path talks to. It never opens its own
/// transaction for an enqueue: the caller passes the transaction that also
/// carries the entity write, so both commit or roll back together.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// The underlying backend.
    pub fn driver(&self) -> &D {
        &self.0
    }
}

impl<D> Outbox<D>
where
    D: Transactional,
{
    pub async fn begin(&self) -> Result<D::Transaction, OutboxError> {
        self.0.begin().await.map_err(OutboxError::store)
    }

    pub async fn commit(&self, tx: D::Transaction) -> Result<(), OutboxError> {
        self.0.commit(tx).await.map_err(OutboxError::store)
    }

    pub async fn rollback(&self, tx: D::Transaction) -> Result<(), OutboxError> {
        self.0.rollback(tx).await.map_err(OutboxError::store)
    }

    /// Enqueue `payload` for the entity `id`.
    ///
    /// A message still pending for the same id has its payload replaced and
    /// keeps its queue position. The message is **not** sent here; it becomes
    /// visible to the scheduler once `tx` commits.
    #[instrument(skip(self, payload, tx), fields(payload_len = payload.len()))]
    pub async fn enqueue(
        &self,
        id: &str,
        payload: &[u8],
        tx: &mut D::Transaction,
    ) -> Result<OutboxMessage, OutboxError>
    where
        D: UpsertMessages,
    {
        self.0
            .upsert(id, payload, tx)
            .await
            .map_err(OutboxError::store)?
            .ok_or_else(|| OutboxError::store(NotStored(id.to_owned())))
    }

    /// Serialize `entity` to JSON and enqueue it under `id`.
    pub async fn enqueue_snapshot<E>(
        &self,
        id: &str,
        entity: &E,
        tx: &mut D::Transaction,
    ) -> Result<OutboxMessage, OutboxError>
    where
        D: UpsertMessages,
        E: Serialize + Sync,
    {
        let payload = serde_json::to_vec(entity).map_err(|err| {
            tracing::error!(%id, error = %err, "Entity snapshot not serialized");
            OutboxError::serialization(err)
        })?;
        self.enqueue(id, &payload, tx).await
    }

    /// Remove the pending message for `id`, returning how many rows matched.
    pub async fn delete_by_id(&self, id: &str, tx: &mut D::Transaction) -> Result<u64, OutboxError>
    where
        D: RemoveMessages,
    {
        self.0
            .delete_by_id(id, tx)
            .await
            .map_err(OutboxError::store)
    }
}

/// Transaction control for an outbox backend.
///
/// Every gateway operation runs inside a transaction obtained here, which
/// lets a caller group it with other work on the same store.
#[async_trait::async_trait]
pub trait Transactional: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Open transaction handle.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}

/// Trait for inserting or replacing pending messages.
///
/// Implementations must resolve the insert/replace race in a single atomic
/// step rather than checking for existence first.
#[async_trait::async_trait]
pub trait UpsertMessages: Transactional {
    /// Store `payload` under `id` and return the stored message, or `None`
    /// if the write did not take effect.
    async fn upsert(
        &self,
        id: &str,
        payload: &[u8],
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error>;
}

/// Trait for taking the next pending message.
#[async_trait::async_trait]
pub trait TakeMessages: Transactional {
    /// Remove and return the pending message with the lowest `seq`.
    ///
    /// Two transactions racing for the same message must not both receive
    /// it. The removal is undone if `tx` rolls back.
    async fn take_one(
        &self,
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error>;
}

/// Trait for removing pending messages by id.
#[async_trait::async_trait]
pub trait RemoveMessages: Transactional {
    /// Delete the message for `id`. Returns 0 when nothing matched.
    async fn delete_by_id(&self, id: &str, tx: &mut Self::Transaction)
    -> Result<u64, Self::Error>;
}
