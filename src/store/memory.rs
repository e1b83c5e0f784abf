//! In-memory backing store.
//!
//! Writes made through a [`MemoryTx`] are staged on the transaction and only
//! become visible when it commits. Ids come from sequences shared by all
//! transactions, so a rolled-back insert leaves a gap just like a database
//! sequence would.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{OutboxStore, StoreError, Transaction, TransactionManager, UserRepository};
use crate::model::{CreateUserParams, NewPendingEvent, PendingEvent, User};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    outbox: Vec<PendingEvent>,
    next_user_id: i64,
    next_event_id: i64,
}

impl Tables {
    fn allocate_user_id(&mut self) -> i64 {
        self.next_user_id += 1;
        self.next_user_id
    }

    fn allocate_event_id(&mut self) -> i64 {
        self.next_event_id += 1;
        self.next_event_id
    }
}

/// A shared in-memory database exposing every store capability.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every committed outbox row, published or not.
    pub fn outbox_rows(&self) -> Vec<PendingEvent> {
        self.tables().outbox.clone()
    }

    /// Number of committed users.
    pub fn user_count(&self) -> usize {
        self.tables().users.len()
    }
}

/// Transaction over a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryTx {
    db: MemoryDatabase,
    users: Vec<User>,
    events: Vec<PendingEvent>,
    closed: bool,
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed = true;

        let mut tables = self.db.tables();
        for user in &self.users {
            if tables.users.iter().any(|u| u.email == user.email) {
                return Err(StoreError::Conflict(format!(
                    "email {} already exists",
                    user.email
                )));
            }
        }

        debug!(
            users = self.users.len(),
            events = self.events.len(),
            "Committing staged rows"
        );
        tables.users.append(&mut self.users);
        tables.outbox.append(&mut self.events);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        // Rolling back after a failed commit has nothing left to discard.
        self.closed = true;
        self.users.clear();
        self.events.clear();
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for MemoryDatabase {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            db: self.clone(),
            users: Vec::new(),
            events: Vec::new(),
            closed: false,
        })
    }
}

#[async_trait]
impl UserRepository for MemoryDatabase {
    type Tx = MemoryTx;

    async fn create(
        &self,
        tx: &mut MemoryTx,
        params: &CreateUserParams,
    ) -> Result<User, StoreError> {
        tx.ensure_open()?;

        let mut tables = self.tables();
        let taken = tables.users.iter().any(|u| u.email == params.email)
            || tx.users.iter().any(|u| u.email == params.email);
        if taken {
            return Err(StoreError::Conflict(format!(
                "email {} already exists",
                params.email
            )));
        }

        let user = User {
            id: tables.allocate_user_id(),
            name: params.name.clone(),
            email: params.email.clone(),
            created_at: Utc::now(),
        };
        tx.users.push(user.clone());
        Ok(user)
    }

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        self.tables()
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.tables()
            .users
            .iter()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user with email {}", email)))
    }
}

#[async_trait]
impl OutboxStore for MemoryDatabase {
    type Tx = MemoryTx;

    async fn create_pending_event(
        &self,
        tx: &mut MemoryTx,
        event: NewPendingEvent,
    ) -> Result<PendingEvent, StoreError> {
        tx.ensure_open()?;

        let row = PendingEvent {
            id: self.tables().allocate_event_id(),
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            created_at: Utc::now(),
            published_at: None,
        };
        tx.events.push(row.clone());
        Ok(row)
    }

    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<PendingEvent>, StoreError> {
        let tables = self.tables();
        let mut rows: Vec<PendingEvent> = tables
            .outbox
            .iter()
            .filter(|e| !e.is_published())
            .cloned()
            .collect();
        // Commit order and id order can differ when transactions interleave.
        rows.sort_by_key(|e| e.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_published(&self, id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if let Some(row) = tables.outbox.iter_mut().find(|e| e.id == id) {
            if row.published_at.is_none() {
                row.published_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn count_unpublished(&self) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .outbox
            .iter()
            .filter(|e| !e.is_published())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn insert_event(db: &MemoryDatabase, aggregate: &str) -> PendingEvent {
        let mut tx = db.begin().await.unwrap();
        let row = db
            .create_pending_event(
                &mut tx,
                NewPendingEvent::new(aggregate, "user_created", b"{}".to_vec()),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        row
    }

    #[tokio::test]
    async fn test_staged_rows_invisible_until_commit() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();

        let user = db
            .create(&mut tx, &CreateUserParams::new("Alice", "a@x.com"))
            .await
            .unwrap();
        assert!(db.get_by_id(user.id).await.unwrap_err().is_not_found());

        tx.commit().await.unwrap();
        assert_eq!(db.get_by_id(user.id).await.unwrap(), user);
    }

    #[tokio::test]
    async fn test_rollback_discards_and_leaves_id_gap() {
        let db = MemoryDatabase::new();

        let mut tx = db.begin().await.unwrap();
        db.create(&mut tx, &CreateUserParams::new("Alice", "a@x.com"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.user_count(), 0);

        let mut tx = db.begin().await.unwrap();
        let user = db
            .create(&mut tx, &CreateUserParams::new("Bob", "b@x.com"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(user.id, 2);
    }

    #[tokio::test]
    async fn test_closed_transaction_rejects_writes() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.commit().await.unwrap();

        let err = db
            .create(&mut tx, &CreateUserParams::new("Alice", "a@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert!(matches!(tx.commit().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        db.create(&mut tx, &CreateUserParams::new("Alice", "a@x.com"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let err = db
            .create(&mut tx, &CreateUserParams::new("Alias", "a@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(db.get_by_email("a@x.com").await.unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn test_fetch_unpublished_is_ordered_and_bounded() {
        let db = MemoryDatabase::new();
        for i in 0..5 {
            insert_event(&db, &format!("user_{}", i)).await;
        }

        let rows = db.fetch_unpublished(3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(rows[0].id, 1);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_id_not_commit_order() {
        let db = MemoryDatabase::new();

        let mut first = db.begin().await.unwrap();
        db.create_pending_event(&mut first, NewPendingEvent::new("user_1", "t", vec![]))
            .await
            .unwrap();
        let second = insert_event(&db, "user_2").await;
        first.commit().await.unwrap();

        let rows = db.fetch_unpublished(10).await.unwrap();
        assert_eq!(rows[0].aggregate_id, "user_1");
        assert_eq!(rows[1].id, second.id);
    }

    #[tokio::test]
    async fn test_mark_published_excludes_row_and_is_idempotent() {
        let db = MemoryDatabase::new();
        let row = insert_event(&db, "user_1").await;
        insert_event(&db, "user_2").await;

        db.mark_published(row.id).await.unwrap();
        let stamped = db.outbox_rows()[0].published_at;
        assert!(stamped.is_some());

        db.mark_published(row.id).await.unwrap();
        assert_eq!(db.outbox_rows()[0].published_at, stamped);

        let rows = db.fetch_unpublished(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].aggregate_id, "user_2");
        assert_eq!(db.count_unpublished().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_published_unknown_id_is_noop() {
        let db = MemoryDatabase::new();
        assert!(db.mark_published(999).await.is_ok());
    }
}
