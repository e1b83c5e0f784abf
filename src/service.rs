//! User creation with outbox recording.
//!
//! [`UserService::create_user`] is the only writer of `user_created` events:
//! the user row and its outbox row are inserted by one unit of work, so
//! either both become visible or neither does.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::{user_aggregate_id, DispatchableEvent, UserCreatedEvent};
use crate::model::{CreateUserParams, NewPendingEvent, User};
use crate::store::{
    OutboxStore, StoreError, TransactionError, TransactionManager, UnitOfWork, UserRepository,
};

/// Errors surfaced to callers of the user service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing or malformed input. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Store or transaction failure. Details are for logs, not for clients.
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServiceError {
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ServiceError::Internal(Box::new(err))
    }
}

impl From<TransactionError<StoreError>> for ServiceError {
    fn from(err: TransactionError<StoreError>) -> Self {
        ServiceError::internal(err)
    }
}

/// User operations as seen by the HTTP layer.
#[async_trait]
pub trait UserOperations: Send + Sync {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, ServiceError>;

    async fn get_user(&self, id: i64) -> Result<User, ServiceError>;
}

/// Creates users and records their `user_created` event atomically.
pub struct UserService<U, O, M> {
    users: Arc<U>,
    outbox: Arc<O>,
    uow: UnitOfWork<M>,
}

impl<U, O, M> UserService<U, O, M>
where
    M: TransactionManager + 'static,
    U: UserRepository<Tx = M::Tx> + 'static,
    O: OutboxStore<Tx = M::Tx> + 'static,
{
    pub fn new(users: Arc<U>, outbox: Arc<O>, uow: UnitOfWork<M>) -> Self {
        Self { users, outbox, uow }
    }

    /// Validate, then insert the user and its pending event in one
    /// transaction.
    pub async fn create_user(&self, params: CreateUserParams) -> Result<User, ServiceError> {
        params.validate()?;

        // The unique constraint still decides races; this only gives the
        // common case a readable error.
        match self.users.get_by_email(&params.email).await {
            Ok(existing) => {
                error!(email = %params.email, existing_id = existing.id, "Email already registered");
                return Err(ServiceError::internal(StoreError::Conflict(format!(
                    "email {} already exists",
                    params.email
                ))));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(ServiceError::internal(e)),
        }

        let users = self.users.clone();
        let outbox = self.outbox.clone();

        let (user, event_id) = self
            .uow
            .with_transaction(move |tx| {
                Box::pin(async move {
                    let user = users.create(tx, &params).await?;

                    let payload = UserCreatedEvent::for_user(&user).encode()?;
                    let event = outbox
                        .create_pending_event(
                            tx,
                            NewPendingEvent::new(
                                user_aggregate_id(user.id),
                                UserCreatedEvent::EVENT_TYPE,
                                payload,
                            ),
                        )
                        .await?;

                    Ok::<_, StoreError>((user, event.id))
                })
            })
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create user");
                ServiceError::from(e)
            })?;

        info!(
            user_id = user.id,
            event_id,
            email = %user.email,
            "User created with pending event"
        );
        Ok(user)
    }

    pub async fn get_user(&self, id: i64) -> Result<User, ServiceError> {
        match self.users.get_by_id(id).await {
            Ok(user) => Ok(user),
            Err(e) if e.is_not_found() => {
                debug!(user_id = id, "User not found");
                Err(ServiceError::NotFound(format!("user {}", id)))
            }
            Err(e) => {
                error!(user_id = id, error = %e, "Failed to load user");
                Err(ServiceError::internal(e))
            }
        }
    }
}

#[async_trait]
impl<U, O, M> UserOperations for UserService<U, O, M>
where
    M: TransactionManager + 'static,
    U: UserRepository<Tx = M::Tx> + 'static,
    O: OutboxStore<Tx = M::Tx> + 'static,
{
    async fn create_user(&self, params: CreateUserParams) -> Result<User, ServiceError> {
        UserService::create_user(self, params).await
    }

    async fn get_user(&self, id: i64) -> Result<User, ServiceError> {
        UserService::get_user(self, id).await
    }
}
