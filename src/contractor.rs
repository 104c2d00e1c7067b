//! Contractor write path.
//!
//! Saving a contractor and enqueueing its snapshot happen in one store
//! transaction: either both become visible or neither does. The snapshot is
//! the JSON of the row as it reads after the write, keyed by the contractor
//! id, so a later save replaces a snapshot that is still pending.

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::outbox::{Outbox, OutboxError, Transactional, UpsertMessages};

/// A business partner record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(::sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct Contractor {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub name_full: Option<String>,
    pub inn: Option<String>,
    pub ogrn: Option<String>,
    /// Country reference id.
    pub country: Option<String>,
    /// Industry reference id.
    pub industry: Option<i32>,
    /// Organizational form reference id.
    pub org_form: Option<i32>,
    /// Set by the store on first save.
    pub create_date: Option<DateTime<Utc>>,
    /// Set by the store on every later save.
    pub modify_date: Option<DateTime<Utc>>,
    pub create_user_id: Option<String>,
    pub modify_user_id: Option<String>,
    #[serde(rename = "active")]
    pub is_active: bool,
}

impl Contractor {
    /// A new active contractor with only the mandatory fields set.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.into(),
            name_full: None,
            inn: None,
            ogrn: None,
            country: None,
            industry: None,
            org_form: None,
            create_date: None,
            modify_date: None,
            create_user_id: None,
            modify_user_id: None,
            is_active: true,
        }
    }
}

/// Persistence of contractors inside an outbox transaction.
#[async_trait::async_trait]
pub trait ContractorRepository: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Transaction shared with the outbox.
    type Transaction: Send;

    /// Insert or update the contractor and return the row as stored.
    async fn save(
        &self,
        contractor: &Contractor,
        tx: &mut Self::Transaction,
    ) -> Result<Contractor, Self::Error>;
}

/// Saves contractors and records their snapshots in the outbox.
pub struct ContractorService<R, D> {
    repository: R,
    outbox: Outbox<D>,
}

impl<R, D> ContractorService<R, D>
where
    D: UpsertMessages,
    R: ContractorRepository<Transaction = <D as Transactional>::Transaction>,
{
    pub fn new(repository: R, outbox: Outbox<D>) -> Self {
        Self { repository, outbox }
    }

    /// Save `contractor` and enqueue its post-write snapshot.
    ///
    /// Any failure rolls back the entity write and the enqueue together and
    /// is returned to the caller.
    #[tracing::instrument(skip_all, fields(id = %contractor.id))]
    pub async fn save(&self, contractor: &Contractor) -> Result<Contractor, SaveError> {
        let mut tx = self.outbox.begin().await.map_err(SaveError::outbox)?;

        let saved = match self.repository.save(contractor, &mut tx).await {
            Ok(saved) => saved,
            Err(err) => {
                self.abort(tx).await;
                return Err(SaveError::repository(err.into()));
            }
        };

        if let Err(err) = self
            .outbox
            .enqueue_snapshot(&saved.id, &saved, &mut tx)
            .await
        {
            self.abort(tx).await;
            return Err(SaveError::outbox(err));
        }

        self.outbox.commit(tx).await.map_err(SaveError::outbox)?;
        tracing::debug!("Contractor saved");
        Ok(saved)
    }

    async fn abort(&self, tx: D::Transaction) {
        if let Err(error) = self.outbox.rollback(tx).await {
            tracing::error!(%error, "Failed to roll back contractor write");
        }
    }
}

/// Error returned by [`ContractorService::save`].
#[derive(Debug)]
pub struct SaveError {
    context: SpanTrace,
    kind: SaveErrorKind,
}

/// Classification of [`SaveError`]s.
#[derive(Debug)]
pub enum SaveErrorKind {
    /// The contractor row could not be written.
    Repository(tower::BoxError),
    /// The snapshot could not be serialized or enqueued.
    Outbox(OutboxError),
}

impl SaveError {
    fn repository(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SaveErrorKind::Repository(err),
        }
    }

    fn outbox(err: OutboxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SaveErrorKind::Outbox(err),
        }
    }

    pub fn kind(&self) -> &SaveErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SaveErrorKind::Repository(err) => writeln!(f, "Repository error: {err}"),
            SaveErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SaveErrorKind::Repository(err) => Some(err.as_ref()),
            SaveErrorKind::Outbox(err) => Some(err),
        }
    }
}
