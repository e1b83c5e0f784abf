//! Scoped transactions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{StoreError, Transaction, TransactionManager};

/// Future returned by a unit-of-work callback. It may borrow the
/// transaction for `'t` but nothing else.
pub type TxFuture<'t, R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 't>>;

/// Failure of [`UnitOfWork::with_transaction`].
#[derive(Debug, Error)]
pub enum TransactionError<E: std::error::Error + 'static> {
    /// The transaction could not be opened; the callback never ran.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] StoreError),

    /// The callback failed and the rollback succeeded.
    #[error("{source}")]
    Work { source: E },

    /// The callback failed and the rollback failed too.
    #[error("transaction failed: {source}, rollback failed: {rollback}")]
    WorkAndRollback { source: E, rollback: StoreError },

    /// The callback succeeded but the commit did not.
    #[error("failed to commit transaction: {source} ({})", rollback_outcome(.rollback))]
    Commit {
        source: StoreError,
        rollback: Option<StoreError>,
    },
}

impl<E: std::error::Error + 'static> TransactionError<E> {
    /// The callback's own error, if the callback is what failed.
    pub fn work_error(&self) -> Option<&E> {
        match self {
            TransactionError::Work { source } | TransactionError::WorkAndRollback { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

fn rollback_outcome(rollback: &Option<StoreError>) -> String {
    match rollback {
        None => "rolled back".to_string(),
        Some(e) => format!("rollback failed: {}", e),
    }
}

/// Runs a callback inside a single transaction and commits only if the
/// callback succeeds.
///
/// No retry is attempted on serialization conflicts.
pub struct UnitOfWork<M> {
    manager: Arc<M>,
}

impl<M> Clone for UnitOfWork<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<M: TransactionManager> UnitOfWork<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    /// Begin, run `work`, then commit or roll back.
    ///
    /// The callback must own whatever it captures (clone `Arc`s in) since
    /// the returned future may only borrow the transaction.
    pub async fn with_transaction<R, E, F>(&self, work: F) -> Result<R, TransactionError<E>>
    where
        F: for<'t> FnOnce(&'t mut M::Tx) -> TxFuture<'t, R, E> + Send,
        R: Send,
        E: std::error::Error + Send + 'static,
    {
        let mut tx = self.manager.begin().await.map_err(TransactionError::Begin)?;
        debug!("Transaction started");

        let outcome = work(&mut tx).await;

        match outcome {
            Ok(value) => {
                if let Err(commit_err) = tx.commit().await {
                    let rollback = tx.rollback().await.err();
                    error!(
                        error = %commit_err,
                        rollback_error = ?rollback.as_ref().map(|e| e.to_string()),
                        "Transaction commit failed"
                    );
                    return Err(TransactionError::Commit {
                        source: commit_err,
                        rollback,
                    });
                }

                debug!("Transaction committed");
                Ok(value)
            }
            Err(source) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %source, "Transaction rolled back");
                    Err(TransactionError::Work { source })
                }
                Err(rollback) => {
                    warn!(
                        error = %source,
                        rollback_error = %rollback,
                        "Transaction rollback failed"
                    );
                    Err(TransactionError::WorkAndRollback { source, rollback })
                }
            },
        }
    }
}
