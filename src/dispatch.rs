//! Tag-based event dispatch.
//!
//! The [`Dispatcher`] maps an `event_type` tag to a route that knows how to
//! decode the raw payload into one concrete [`DispatchableEvent`] type and
//! which [`EventHandler`] receives it.
//!
//! ```text
//! ("user_created", payload bytes)
//!     │
//!     ▼
//! ┌──────────────────────────────────────────┐
//! │  DISPATCHER                              │
//! │  routes["user_created"]? YES             │
//! │  decode -> UserCreatedEvent              │
//! │  handle -> WelcomeEmailHandler           │
//! └──────────────────────────────────────────┘
//! ```
//!
//! A tag with no route is not an error: the event is reported as
//! [`DispatchOutcome::Ignored`] and may be acknowledged.

use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::consumer::ConsumeError;
use crate::event::DispatchableEvent;
use crate::handlers::EventHandler;

/// What happened to a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and handled by the named handler
    Handled { handler: String },

    /// No route for this tag
    Ignored,
}

/// A decoder paired with a handler, with the event type erased.
#[async_trait]
trait Route: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn call(&self, event_type: &str, payload: &[u8]) -> Result<(), ConsumeError>;
}

struct TypedRoute<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> Route for TypedRoute<E, H>
where
    E: DispatchableEvent,
    H: EventHandler<E>,
{
    fn handler_name(&self) -> &str {
        self.handler.name()
    }

    async fn call(&self, event_type: &str, payload: &[u8]) -> Result<(), ConsumeError> {
        let event = E::decode(payload).map_err(|source| ConsumeError::Decode {
            event_type: event_type.to_string(),
            source,
        })?;

        self.handler
            .handle(event)
            .await
            .map_err(|source| ConsumeError::Handler {
                handler: self.handler.name().to_string(),
                source,
            })
    }
}

/// Registry of event type tag -> (decoder, handler).
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<&'static str, Arc<dyn Route>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `E::EVENT_TYPE` to `handler`. Registering the same tag again
    /// replaces the earlier handler.
    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: DispatchableEvent,
        H: EventHandler<E> + 'static,
    {
        let route: Arc<dyn Route> = Arc::new(TypedRoute {
            handler,
            _event: PhantomData::<fn() -> E>,
        });

        debug!(
            event_type = E::EVENT_TYPE,
            handler = %route.handler_name(),
            "Registering event handler"
        );

        if let Some(previous) = self.routes.insert(E::EVENT_TYPE, route) {
            warn!(
                event_type = E::EVENT_TYPE,
                replaced = %previous.handler_name(),
                "Replacing existing event handler"
            );
        }
        self
    }

    /// Registered tags, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.routes.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decode `payload` as the event registered for `event_type` and run
    /// its handler.
    pub async fn dispatch(
        &self,
        event_type: &str,
        payload: &[u8],
    ) -> Result<DispatchOutcome, ConsumeError> {
        let Some(route) = self.routes.get(event_type) else {
            warn!(event_type = %event_type, "No handler registered for event type");
            return Ok(DispatchOutcome::Ignored);
        };

        route.call(event_type, payload).await?;

        debug!(
            event_type = %event_type,
            handler = %route.handler_name(),
            "Event handled"
        );
        Ok(DispatchOutcome::Handled {
            handler: route.handler_name().to_string(),
        })
    }
}
