use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use crate::outbox::{OutboxMessage, RemoveMessages, TakeMessages, Transactional, UpsertMessages};

/// An in-memory outbox for testing or local usage.
///
/// Transactions follow the visibility rules of the Postgres backend closely
/// enough for tests: upserts are staged and only become visible on commit,
/// while takes and deletes remove rows immediately (as a row lock would hide
/// them from other takers) and put them back on rollback.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    rows: HashMap<String, OutboxMessage>,
    next_seq: i64,
}

impl State {
    fn seq_for(&mut self, id: &str) -> i64 {
        match self.rows.get(id) {
            Some(row) => row.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        }
    }

    fn restore(&mut self, message: OutboxMessage) {
        // A newer committed write for the same id wins over the restored row.
        self.rows.entry(message.id.clone()).or_insert(message);
    }
}

impl InMemoryOutbox {
    /// Committed messages in delivery order.
    pub fn pending(&self) -> Vec<OutboxMessage> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state.rows.values().cloned().collect();
        rows.sort_by_key(|m| m.seq);
        rows
    }

    /// Number of committed messages.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transaction handle of [`InMemoryOutbox`].
///
/// Dropping the handle without committing behaves like a rollback.
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<OutboxMessage>,
    removed: Vec<OutboxMessage>,
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
    finished: bool,
}

impl InMemoryTransaction {
    /// Register work that must only become visible if the transaction
    /// commits, such as an entity write sharing this transaction.
    ///
    /// Hooks run on commit before the staged messages are published to the
    /// store, so a message is never observable ahead of its entity. They
    /// must not lock the outbox themselves.
    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(f));
    }

    fn commit(mut self) {
        for f in self.on_commit.drain(..) {
            f();
        }
        let mut state = self.state.lock();
        for message in self.staged.drain(..) {
            match state.rows.get_mut(&message.id) {
                Some(row) => row.payload = message.payload,
                None => {
                    state.rows.insert(message.id.clone(), message);
                }
            }
        }
        drop(state);
        self.removed.clear();
        self.finished = true;
    }

    fn rollback(&mut self) {
        let mut state = self.state.lock();
        for message in self.removed.drain(..) {
            state.restore(message);
        }
        self.staged.clear();
        self.on_commit.clear();
        self.finished = true;
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

/// Error type for `InMemoryOutbox` operations.
///
/// The in-memory backend cannot fail, the type exists to satisfy the trait
/// seams.
#[derive(Debug)]
pub struct InMemoryOutboxError;

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "In-memory outbox error")
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[async_trait]
impl Transactional for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            removed: Vec::new(),
            on_commit: Vec::new(),
            finished: false,
        })
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.commit();
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.rollback();
        Ok(())
    }
}

#[async_trait]
impl UpsertMessages for InMemoryOutbox {
    async fn upsert(
        &self,
        id: &str,
        payload: &[u8],
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error> {
        if let Some(staged) = tx.staged.iter_mut().find(|m| m.id == id) {
            staged.payload = payload.to_vec();
            return Ok(Some(staged.clone()));
        }

        let seq = self.state.lock().seq_for(id);
        let message = OutboxMessage {
            id: id.to_owned(),
            payload: payload.to_vec(),
            seq,
        };
        tx.staged.push(message.clone());
        Ok(Some(message))
    }
}

#[async_trait]
impl TakeMessages for InMemoryOutbox {
    async fn take_one(
        &self,
        tx: &mut Self::Transaction,
    ) -> Result<Option<OutboxMessage>, Self::Error> {
        let mut state = self.state.lock();
        let next = state
            .rows
            .values()
            .min_by_key(|m| m.seq)
            .map(|m| m.id.clone());

        let taken = next.and_then(|id| state.rows.remove(&id));
        if let Some(message) = &taken {
            tx.removed.push(message.clone());
        }
        Ok(taken)
    }
}

#[async_trait]
impl RemoveMessages for InMemoryOutbox {
    async fn delete_by_id(
        &self,
        id: &str,
        tx: &mut Self::Transaction,
    ) -> Result<u64, Self::Error> {
        let staged_before = tx.staged.len();
        tx.staged.retain(|m| m.id != id);
        let mut deleted = (staged_before - tx.staged.len()) as u64;

        if let Some(message) = self.state.lock().rows.remove(id) {
            tx.removed.push(message);
            deleted = 1;
        }
        Ok(deleted)
    }
}
