//! Handler routing: dispatches an [`Inbound`] delivery to the service
//! registered for its routing key.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use switchboard_core::{ReplyBody, RoutingKey};
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use super::{DispatchError, HandlerError, Inbound};

type HandlerService = BoxCloneService<Inbound, Bytes, DispatchError>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, DispatchError>> + Send>>;

// ---------------------------------------------------------------------------
// HandlerRouter
// ---------------------------------------------------------------------------

/// Routing key to handler table.
///
/// Keys are matched exactly: the broker bindings decide which deliveries
/// reach the queue, the router decides which handler runs. A delivery whose
/// key has no handler fails with `DispatchError::Unroutable`.
#[derive(Clone, Default)]
pub struct HandlerRouter {
    handlers: HashMap<RoutingKey, HandlerService>,
}

impl HandlerRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tower service for `routing_key`, replacing any previous
    /// registration.
    pub fn register<S>(&mut self, routing_key: RoutingKey, service: S)
    where
        S: Service<Inbound, Response = Bytes, Error = DispatchError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.handlers.insert(routing_key, BoxCloneService::new(service));
    }

    /// Registers an async function from request payload to reply payload.
    pub fn register_fn<F, Fut>(&mut self, routing_key: RoutingKey, handler: F)
    where
        F: Fn(Bytes) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let service = tower::service_fn(move |inbound: Inbound| {
            let fut = handler(inbound.payload);
            async move { fut.await.map_err(DispatchError::from) }
        });
        self.register(routing_key, service);
    }

    /// Registers a JSON handler. The payload is decoded into `Req`; the
    /// handler's value becomes the `data` of an `ok` [`ReplyBody`]. A payload
    /// that does not decode is a permanent handler error.
    pub fn register_json<Req, F, Fut>(&mut self, routing_key: RoutingKey, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        self.register_fn(routing_key, move |payload: Bytes| {
            let handler = handler.clone();
            async move {
                let request: Req = serde_json::from_slice(&payload)
                    .map_err(|e| HandlerError::permanent(format!("malformed request: {e}")))?;
                let data = handler(request).await?;
                Ok(ReplyBody::ok(data).to_bytes())
            }
        });
    }

    #[must_use]
    pub fn contains(&self, routing_key: &RoutingKey) -> bool {
        self.handlers.contains_key(routing_key)
    }

    /// Registered routing keys, sorted.
    #[must_use]
    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<RoutingKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Service<Inbound> for HandlerRouter {
    type Response = Bytes;
    type Error = DispatchError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each call drives its own clone of the handler to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inbound: Inbound) -> Self::Future {
        match self.handlers.get(&inbound.routing_key) {
            Some(handler) => Box::pin(handler.clone().oneshot(inbound)),
            None => {
                let routing_key = inbound.routing_key.as_str().to_string();
                Box::pin(async move { Err(DispatchError::Unroutable { routing_key }) })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
