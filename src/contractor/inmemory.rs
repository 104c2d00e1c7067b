use std::{collections::HashMap, convert::Infallible, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::{
    contractor::{Contractor, ContractorRepository},
    outbox::inmemory::InMemoryTransaction,
};

/// An in-memory contractor table sharing transactions with
/// [`InMemoryOutbox`](crate::outbox::inmemory::InMemoryOutbox).
///
/// Writes are applied when the transaction commits.
#[derive(Clone, Default)]
pub struct InMemoryContractors {
    rows: Arc<Mutex<HashMap<String, Contractor>>>,
}

impl InMemoryContractors {
    /// The committed contractor with `id`.
    pub fn get(&self, id: &str) -> Option<Contractor> {
        self.rows.lock().get(id).cloned()
    }
}

#[async_trait]
impl ContractorRepository for InMemoryContractors {
    type Error = Infallible;
    type Transaction = InMemoryTransaction;

    async fn save(
        &self,
        contractor: &Contractor,
        tx: &mut Self::Transaction,
    ) -> Result<Contractor, Self::Error> {
        let now = Utc::now();
        let mut saved = contractor.clone();

        match self.get(&contractor.id) {
            Some(existing) => {
                saved.create_date = existing.create_date;
                saved.create_user_id = existing.create_user_id;
                saved.modify_date = Some(now);
            }
            None => {
                saved.create_date = Some(now);
                saved.create_user_id = contractor
                    .create_user_id
                    .clone()
                    .or_else(|| contractor.modify_user_id.clone());
                saved.modify_date = None;
            }
        }

        let rows = Arc::clone(&self.rows);
        let row = saved.clone();
        tx.on_commit(move || {
            rows.lock().insert(row.id.clone(), row);
        });
        Ok(saved)
    }
}
