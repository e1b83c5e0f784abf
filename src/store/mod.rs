//! Persistence capabilities.
//!
//! Every store is a trait so the pipeline runs unchanged against
//! [`postgres`] in production and [`memory`] in tests. Writes that must be
//! atomic with each other take a `&mut Tx` obtained from a
//! [`TransactionManager`]; the [`UnitOfWork`] owns the begin/commit/rollback
//! sequence.
//!
//! ```text
//! UnitOfWork::with_transaction(|tx| {
//!     users.create(tx, ..)            ─┐
//!     outbox.create_pending_event(tx) ─┴─ commit together or not at all
//! })
//! ```

pub mod memory;
pub mod postgres;
pub mod unit_of_work;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CreateUserParams, NewPendingEvent, PendingEvent, User};

pub use unit_of_work::{TransactionError, TxFuture, UnitOfWork};

/// Errors raised by stores and transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transaction already closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// A transaction handle. Both methods may be called after the other has
/// failed; implementations report what happened rather than panicking.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Opens transactions. One level of scoping only: no savepoints.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Persists users. Knows nothing about the outbox.
#[async_trait]
pub trait UserRepository: Send + Sync {
    type Tx: Send;

    /// Insert a user inside the caller's transaction.
    async fn create(&self, tx: &mut Self::Tx, params: &CreateUserParams)
        -> Result<User, StoreError>;

    /// Fetch a committed user; [`StoreError::NotFound`] if absent.
    async fn get_by_id(&self, id: i64) -> Result<User, StoreError>;

    /// Fetch a committed user by email; [`StoreError::NotFound`] if absent.
    async fn get_by_email(&self, email: &str) -> Result<User, StoreError>;
}

/// Durable table of pending and published events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Tx: Send;

    /// Insert an unpublished row inside the caller's transaction.
    async fn create_pending_event(
        &self,
        tx: &mut Self::Tx,
        event: NewPendingEvent,
    ) -> Result<PendingEvent, StoreError>;

    /// Unpublished rows in ascending id order, at most `limit` of them.
    ///
    /// No row is claimed: concurrent callers may receive overlapping sets.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<PendingEvent>, StoreError>;

    /// Stamp `published_at` with the current time. A row that is already
    /// published, or does not exist, is left untouched.
    async fn mark_published(&self, id: i64) -> Result<(), StoreError>;

    /// Number of rows still waiting to be published.
    async fn count_unpublished(&self) -> Result<u64, StoreError>;
}
